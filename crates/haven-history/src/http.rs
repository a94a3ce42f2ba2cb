use std::collections::HashMap;

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};

use haven_types::api::{
    FetchRequest, FetchResponse, ReactionGroup, ReactionSummaryRequest, ReactionSummaryResponse,
};
use haven_types::models::{ConversationMeta, Message};

use crate::enrichment::EnrichmentSource;
use crate::error::FetchError;
use crate::fetch::HistorySource;

/// REST client for the Haven history endpoints.
#[derive(Clone)]
pub struct HttpHistorySource {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpHistorySource {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

async fn check(resp: Response) -> Result<Response, FetchError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(FetchError::Failed(format!("{} ({}): {}", resp_context(status), status, body)))
}

fn resp_context(status: StatusCode) -> &'static str {
    if status.is_server_error() {
        "Server error"
    } else {
        "Request rejected"
    }
}

impl HistorySource for HttpHistorySource {
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Message>, FetchError> {
        let resp = self
            .client
            .get(self.url(&format!("/conversations/{}/messages", request.conversation_id)))
            .header("Authorization", self.bearer())
            .query(&request)
            .send()
            .await?;
        let page: FetchResponse = check(resp).await?.json().await?;
        Ok(page.messages)
    }

    async fn conversation(&self, conversation_id: i64) -> Result<ConversationMeta, FetchError> {
        let resp = self
            .client
            .get(self.url(&format!("/conversations/{}", conversation_id)))
            .header("Authorization", self.bearer())
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

impl EnrichmentSource for HttpHistorySource {
    async fn fetch_reactions(
        &self,
        conversation_id: i64,
        message_ids: Vec<i64>,
    ) -> Result<HashMap<i64, Vec<ReactionGroup>>, FetchError> {
        let resp = self
            .client
            .post(self.url(&format!(
                "/conversations/{}/reactions/summary",
                conversation_id
            )))
            .header("Authorization", self.bearer())
            .json(&ReactionSummaryRequest { message_ids })
            .send()
            .await?;
        let body: ReactionSummaryResponse = check(resp).await?.json().await?;
        Ok(body.summaries)
    }

    async fn fetch_avatar(&self, owner_id: i64) -> Result<Option<Bytes>, FetchError> {
        let resp = self
            .client
            .get(self.url(&format!("/users/{}/avatar", owner_id)))
            .header("Authorization", self.bearer())
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.bytes().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let source = HttpHistorySource::new("https://haven.example/api/", "tok");
        assert_eq!(source.url("/conversations/4"), "https://haven.example/api/conversations/4");
        assert_eq!(source.bearer(), "Bearer tok");
    }
}
