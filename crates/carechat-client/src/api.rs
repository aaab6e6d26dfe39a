//! Request/response collaborators: the persistence API and the user
//! directory, plus their HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use carechat_shared::constants::API_PREFIX;
use carechat_shared::protocol::{
    ApiResponse, ConversationSummary, Counterparty, DeletedMessage, MessageRecord,
    SendMessageRequest, UnreadCounts,
};
use carechat_shared::types::{Credential, Role, ServerMessageId, UserId};
use carechat_shared::ChatError;

/// Durable message storage behind the chat core.
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    /// `GET conversations`
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError>;

    /// `GET conversations/{counterparty}/messages`, ascending canonical order.
    async fn fetch_history(
        &self,
        counterparty: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, ChatError>;

    /// `POST messages`
    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessageRecord, ChatError>;

    /// `PATCH conversations/{counterparty}/read`
    async fn mark_read(&self, counterparty: &UserId) -> Result<(), ChatError>;

    /// `DELETE messages/{id}`. Only the sender may delete.
    async fn delete_message(&self, id: &ServerMessageId) -> Result<(), ChatError>;

    /// `GET unread-count`
    async fn unread_counts(&self) -> Result<UnreadCounts, ChatError>;
}

/// Source of the raw counterparty list.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn eligible_counterparties(&self, roles: &[Role]) -> Result<Vec<Counterparty>, ChatError>;
}

/// reqwest client for the chat REST API. Implements both collaborators.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpApi {
    pub fn new(
        base_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ChatError> {
        let response = request
            .header(AUTHORIZATION, self.credential.authorization_header())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth(format!("server answered {status}")));
        }

        let body: ApiResponse<T> = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(ChatError::Protocol(format!("unexpected response body: {e}")))
            }
            Err(_) => return Err(ChatError::Persistence(format!("server answered {status}"))),
        };

        if !status.is_success() || !body.success {
            let message = body.message.unwrap_or_else(|| "request failed".to_string());
            return Err(ChatError::Persistence(format!("{status}: {message}")));
        }
        body.into_result().map_err(ChatError::Persistence)
    }
}

/// Offline and timeout conditions are network errors; anything else that
/// stops the request is treated as a persistence failure.
fn classify_request_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ChatError::Network(e.to_string())
    } else {
        ChatError::Persistence(e.to_string())
    }
}

#[async_trait]
impl PersistenceApi for HttpApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        self.execute(self.client.get(self.url("/conversations"))).await
    }

    async fn fetch_history(
        &self,
        counterparty: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        debug!(counterparty = %counterparty, limit, offset, "Fetching history");
        let url = self.url(&format!("/conversations/{counterparty}/messages"));
        self.execute(
            self.client
                .get(url)
                .query(&[("limit", limit), ("offset", offset)]),
        )
        .await
    }

    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessageRecord, ChatError> {
        self.execute(self.client.post(self.url("/messages")).json(request))
            .await
    }

    async fn mark_read(&self, counterparty: &UserId) -> Result<(), ChatError> {
        let url = self.url(&format!("/conversations/{counterparty}/read"));
        let _: serde_json::Value = self.execute(self.client.patch(url)).await?;
        Ok(())
    }

    async fn delete_message(&self, id: &ServerMessageId) -> Result<(), ChatError> {
        let url = self.url(&format!("/messages/{id}"));
        let deleted: DeletedMessage = self.execute(self.client.delete(url)).await?;
        debug!(msg_id = %deleted.message_id, "Message deleted on the server");
        Ok(())
    }

    async fn unread_counts(&self) -> Result<UnreadCounts, ChatError> {
        self.execute(self.client.get(self.url("/unread-count"))).await
    }
}

#[async_trait]
impl DirectorySource for HttpApi {
    async fn eligible_counterparties(&self, roles: &[Role]) -> Result<Vec<Counterparty>, ChatError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let roles = roles
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.execute(self.client.get(self.url("/users")).query(&[("roles", roles)]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_carry_the_api_prefix() {
        let api = HttpApi::new(
            "http://localhost:5000/",
            Credential::new("t"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            api.url("/conversations"),
            "http://localhost:5000/api/chat/conversations"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let api = HttpApi::new(
            "http://127.0.0.1:9",
            Credential::new("t"),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = api.list_conversations().await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)), "got {err:?}");
    }
}
