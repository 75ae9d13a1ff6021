//! Assistant backend REST surface: chat sessions and their history.

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ByteStream, ChatTransport};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSessionRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// Maps a non-2xx response to `Error::Http`, keeping the body as the message.
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body
    };
    Err(Error::Http {
        status: status.as_u16(),
        message,
    })
}

impl ChatApi {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<ChatSessionRecord> {
        let request = self
            .client
            .post(self.url("/sessions"))
            .json(&json!({ "title": title }));
        let response = check_status(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<ChatSessionRecord>> {
        let request = self.client.get(self.url("/sessions"));
        let response = check_status(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<ChatSessionRecord> {
        let request = self.client.get(self.url(&format!("/sessions/{}", session_id)));
        let response = check_status(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&format!("/sessions/{}", session_id)));
        check_status(self.authorized(request).send().await?).await?;
        Ok(())
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<ChatMessageRecord>> {
        let request = self
            .client
            .get(self.url(&format!("/sessions/{}/messages", session_id)));
        let response = check_status(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl ChatTransport for ChatApi {
    async fn open(&self, session_id: &str, message: &str) -> Result<ByteStream> {
        let url = self.url(&format!("/sessions/{}/chat", session_id));
        debug!("Opening chat stream {}", url);
        let request = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(&json!({ "message": message }));
        let response = check_status(self.authorized(request).send().await?).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed())
    }
}
