/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

/// Application state the engine depends on. Passed at construction and
/// replaced explicitly through the history handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    pub current_user_id: i64,
    pub connection: ConnectionStatus,
}

impl SyncContext {
    pub fn new(current_user_id: i64) -> Self {
        Self {
            current_user_id,
            connection: ConnectionStatus::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionStatus::Connected
    }
}
