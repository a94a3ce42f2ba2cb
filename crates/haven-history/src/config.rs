use std::time::Duration;

/// Tunables of the history engine.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryConfig {
    /// Rows requested per page. A shorter page means that edge is exhausted.
    pub page_size: usize,
    /// Distance in logical pixels from an edge that triggers a load-more.
    pub load_more_threshold: f64,
    /// How long a jumped-to message stays highlighted.
    pub highlight_duration: Duration,
    /// Quiet period after the last scroll before edge loads are evaluated.
    pub scroll_debounce: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            load_more_threshold: 800.0,
            highlight_duration: Duration::from_millis(2500),
            scroll_debounce: Duration::from_millis(500),
        }
    }
}

impl HistoryConfig {
    /// Defaults overridden by `HAVEN_HISTORY_*` environment variables.
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env_parse("HAVEN_HISTORY_PAGE_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.page_size),
            load_more_threshold: env_parse("HAVEN_HISTORY_THRESHOLD_PX")
                .unwrap_or(defaults.load_more_threshold),
            highlight_duration: env_parse("HAVEN_HISTORY_HIGHLIGHT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.highlight_duration),
            scroll_debounce: env_parse("HAVEN_HISTORY_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.scroll_debounce),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
