//! Snapshot/CRUD HTTP client.
//!
//! Thin, authenticated wrapper over the discussion REST API: snapshot reads,
//! message create/edit/delete, and the binary file fetch used by the media
//! cache. Every call attaches a bearer credential.

use std::sync::Arc;

use bytes::Bytes;
use parley_proto::{Discussion, DiscussionId, Message, MessageId, ResourceKey};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::{
    auth::{AuthError, CachedTokens},
    config::ClientConfig,
};

/// Responses no larger than this with a textual content type are treated as
/// error payloads rather than binary content.
const ERROR_BODY_LIMIT: usize = 512;

/// Request timeout for CRUD calls.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors raised by API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The bearer credential could not be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The request failed at the HTTP layer (connect, timeout, TLS).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },

    /// The response body did not decode as the expected JSON shape.
    #[error("response decoding failed: {0}")]
    Decode(String),

    /// A file fetch answered with a small textual body instead of binary
    /// content; the server is reporting an error in-band.
    #[error("file fetch returned an error payload: {body}")]
    ErrorPayload {
        /// The textual payload.
        body: String,
    },
}

impl ApiError {
    fn from_status(status: StatusCode, body: String) -> Self {
        Self::Status { status: status.as_u16(), body }
    }
}

/// A message to be created, with optional attachments.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    /// Text body. May be empty when an attachment is present.
    pub text: String,
    /// Image attachment: file name and content.
    pub image: Option<(String, Bytes)>,
    /// Video attachment: file name and content.
    pub video: Option<(String, Bytes)>,
}

impl MessageDraft {
    /// Draft with a text body only.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    /// Whether the draft satisfies the message content invariant.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || self.image.is_some() || self.video.is_some()
    }
}

/// Authenticated client for the discussion REST API.
pub struct DiscussionApi {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<CachedTokens>,
}

impl DiscussionApi {
    /// Build a client for the configured base URL.
    pub fn new(config: &ClientConfig, tokens: Arc<CachedTokens>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base_url: config.base_url.trim_end_matches('/').to_owned(), tokens })
    }

    /// Fetch a discussion's metadata.
    pub async fn discussion(&self, id: &DiscussionId) -> Result<Discussion, ApiError> {
        let url = format!("{}/discussions/{id}", self.base_url);
        let response = self.get(&url).await?;
        Self::decode_json(response).await
    }

    /// Fetch the message snapshot for a discussion.
    pub async fn messages(&self, id: &DiscussionId) -> Result<Vec<Message>, ApiError> {
        let url = format!("{}/discussions/{id}/messages", self.base_url);
        let response = self.get(&url).await?;
        Self::decode_json(response).await
    }

    /// Create a message. Text and attachments go up as a multipart form; the
    /// server responds with the confirmed message, id assigned.
    pub async fn create_message(
        &self,
        id: &DiscussionId,
        draft: MessageDraft,
    ) -> Result<Message, ApiError> {
        let url = format!("{}/discussions/{id}/messages", self.base_url);

        let mut form = reqwest::multipart::Form::new().text("text", draft.text);
        if let Some((filename, content)) = draft.image {
            let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(filename);
            form = form.part("image", part);
        }
        if let Some((filename, content)) = draft.video {
            let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(filename);
            form = form.part("video", part);
        }

        let token = self.tokens.bearer().await?;
        let response =
            self.http.post(&url).bearer_auth(token).multipart(form).send().await?;
        let response = Self::check_status(response).await?;
        Self::decode_json(response).await
    }

    /// Replace a message's text body.
    pub async fn update_message(
        &self,
        id: &DiscussionId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{}/discussions/{id}/messages/{message_id}", self.base_url);
        let token = self.tokens.bearer().await?;
        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Delete a message.
    pub async fn delete_message(
        &self,
        id: &DiscussionId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        let url = format!("{}/discussions/{id}/messages/{message_id}", self.base_url);
        let token = self.tokens.bearer().await?;
        let response = self.http.delete(&url).bearer_auth(token).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Fetch an attachment's binary content.
    ///
    /// A success response that is small **and** textual is an in-band error
    /// payload, not valid binary content; it is surfaced as
    /// [`ApiError::ErrorPayload`] instead of being returned.
    pub async fn fetch_file(&self, key: &ResourceKey) -> Result<Bytes, ApiError> {
        let url = format!(
            "{}/discussions/files/{}/{}/{}",
            self.base_url,
            key.discussion,
            key.kind.path_segment(),
            key.filename
        );

        let response = self.get(&url).await?;

        let textual = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_textual_content_type);

        let bytes = response.bytes().await?;
        if textual && bytes.len() <= ERROR_BODY_LIMIT {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            debug!(key = %key, %body, "file fetch answered with an error payload");
            return Err(ApiError::ErrorPayload { body });
        }

        Ok(bytes)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ApiError> {
        let token = self.tokens.bearer().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Self::check_status(response).await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, body))
    }

    async fn decode_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Whether a content type denotes text rather than binary media.
fn is_textual_content_type(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("xml")
        || content_type.contains("html")
}
