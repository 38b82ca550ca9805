//! REST collaborator for conversation/message CRUD.
//!
//! The server answers every request with a uniform `{success, data | error}`
//! envelope. The trait keeps the sync client testable without a network;
//! [`HttpApi`] is the reqwest-backed production implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;

use crate::connection::CredentialProvider;
use crate::error::SyncError;
use crate::model::{Conversation, Message};

/// Uniform response envelope used by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    // No serde(default) here: it would put a `T: Default` bound on the
    // derived Deserialize impl, and missing Option fields decode to None
    // anyway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn into_result(self) -> Result<T, SyncError> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(SyncError::Api("missing data in response".to_string())),
            (false, _) => Err(SyncError::Api(
                self.error.unwrap_or_else(|| "request rejected".to_string()),
            )),
        }
    }

    /// For endpoints whose success carries no body (deletes).
    pub fn into_unit_result(self) -> Result<(), SyncError> {
        if self.success {
            Ok(())
        } else {
            Err(SyncError::Api(
                self.error.unwrap_or_else(|| "request rejected".to_string()),
            ))
        }
    }
}

/// Conversation/message CRUD contract consumed by the sync client.
pub trait ChatApi: Send + Sync {
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<Conversation>, SyncError>> + Send;

    fn create_conversation(
        &self,
        title: Option<&str>,
    ) -> impl Future<Output = Result<Conversation, SyncError>> + Send;

    fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> impl Future<Output = Result<Conversation, SyncError>> + Send;

    fn delete_conversation(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, SyncError>> + Send;

    fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        files: &[String],
    ) -> impl Future<Output = Result<Message, SyncError>> + Send;

    fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// HTTP implementation of [`ChatApi`].
pub struct HttpApi {
    base_url: String,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiEnvelope<T>, SyncError> {
        let response = self.authorize(request).send().await?;
        Ok(response.json::<ApiEnvelope<T>>().await?)
    }
}

impl ChatApi for HttpApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        self.execute(self.http.get(self.url("/api/conversations")))
            .await?
            .into_result()
    }

    async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation, SyncError> {
        let request = self
            .http
            .post(self.url("/api/conversations"))
            .json(&json!({ "title": title }));
        self.execute(request).await?.into_result()
    }

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<Conversation, SyncError> {
        let request = self
            .http
            .patch(self.url(&format!("/api/conversations/{conversation_id}")))
            .json(&json!({ "title": title }));
        self.execute(request).await?.into_result()
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.execute::<serde_json::Value>(
            self.http
                .delete(self.url(&format!("/api/conversations/{conversation_id}"))),
        )
        .await?
        .into_unit_result()
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        self.execute(
            self.http
                .get(self.url(&format!("/api/conversations/{conversation_id}/messages"))),
        )
        .await?
        .into_result()
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        files: &[String],
    ) -> Result<Message, SyncError> {
        let request = self
            .http
            .post(self.url(&format!("/api/conversations/{conversation_id}/messages")))
            .json(&json!({ "content": content, "files": files }));
        self.execute(request).await?.into_result()
    }

    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), SyncError> {
        self.execute::<serde_json::Value>(self.http.delete(self.url(&format!(
            "/api/conversations/{conversation_id}/messages/{message_id}"
        ))))
        .await?
        .into_unit_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_yields_data() {
        let envelope: ApiEnvelope<i32> =
            serde_json::from_str(r#"{"success":true,"data":42}"#).unwrap();
        assert_eq!(envelope.into_result().unwrap(), 42);
    }

    #[test]
    fn envelope_failure_yields_error_message() {
        let envelope: ApiEnvelope<i32> =
            serde_json::from_str(r#"{"success":false,"error":"nope"}"#).unwrap();
        match envelope.into_result() {
            Err(SyncError::Api(message)) => assert_eq!(message, "nope"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn envelope_deserializes_for_payloads_without_default() {
        // Conversation has no Default impl; the envelope must not require one.
        let raw = r#"{"success":true,"data":{"id":"c1","title":"t","updatedAt":"2026-01-01T00:00:00Z"}}"#;
        let envelope: ApiEnvelope<Conversation> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.into_result().unwrap().id, "c1");
    }

    #[test]
    fn envelope_unit_success_without_data() {
        let envelope: ApiEnvelope<serde_json::Value> =
            serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(envelope.into_unit_result().is_ok());
    }
}
