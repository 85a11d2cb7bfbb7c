//! Buffered response data and task outcomes

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::TaskError;

/// Terminal verdict of a task.
///
/// `Failure` is sticky: once recorded, a task never returns to `Success`
/// and later failures do not replace the first cause.
#[derive(Debug, Clone, Default)]
pub enum Outcome {
    #[default]
    Unset,
    Success,
    Failure(Arc<TaskError>),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// Record a success unless a failure is already present
    pub(crate) fn succeed(&mut self) {
        if !self.is_failure() {
            *self = Outcome::Success;
        }
    }

    /// Record a failure unless one is already present
    pub(crate) fn fail(&mut self, err: TaskError) -> bool {
        if self.is_failure() {
            return false;
        }
        *self = Outcome::Failure(Arc::new(err));
        true
    }

    pub(crate) fn apply(&mut self, result: Result<(), TaskError>) {
        match result {
            Ok(()) => self.succeed(),
            Err(err) => {
                self.fail(err);
            }
        }
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Final URL after redirects, if the transport knows it
    pub url: Option<String>,
}

impl ResponseMeta {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), url: None }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }
}

/// Snapshot of everything a task buffered, handed to response handlers
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub meta: Option<ResponseMeta>,
    pub body: Bytes,
    /// Durable location of a downloaded payload
    pub file: Option<PathBuf>,
}

impl Response {
    pub fn status(&self) -> Option<StatusCode> {
        self.meta.as_ref().map(|meta| meta.status)
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn text(&self) -> Result<&str, TaskError> {
        std::str::from_utf8(&self.body).map_err(|e| TaskError::Decode(e.to_string()))
    }

    /// Decode the body as JSON. An empty body is an error rather than `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        if self.body.is_empty() {
            return Err(TaskError::EmptyBody);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_failure_is_sticky() {
        let mut outcome = Outcome::Unset;
        outcome.succeed();
        assert!(outcome.is_success());

        assert!(outcome.fail(TaskError::domain("first")));
        assert!(!outcome.fail(TaskError::domain("second")));
        outcome.succeed();
        assert_eq!(outcome.error().unwrap().to_string(), "first");
    }

    #[test]
    fn test_apply_result() {
        let mut outcome = Outcome::default();
        outcome.apply(Ok(()));
        assert!(outcome.is_success());
        outcome.apply(Err(TaskError::MissingFile));
        assert!(matches!(outcome.error(), Some(TaskError::MissingFile)));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Post {
        id: u32,
        title: String,
    }

    #[test]
    fn test_json_decoding() {
        let response = Response {
            body: Bytes::from_static(br#"{"id": 1, "title": "hello"}"#),
            ..Default::default()
        };
        let post: Post = response.json().unwrap();
        assert_eq!(post, Post { id: 1, title: "hello".to_string() });

        let empty = Response::default();
        assert!(matches!(empty.json::<Post>(), Err(TaskError::EmptyBody)));

        let garbage = Response { body: Bytes::from_static(b"<html>"), ..Default::default() };
        assert!(matches!(garbage.json::<Post>(), Err(TaskError::Decode(_))));
    }

    #[test]
    fn test_meta_accessors() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(http::header::CONTENT_LENGTH, "42".parse().unwrap());
        let meta = ResponseMeta::new(StatusCode::OK).with_headers(headers);
        assert!(meta.is_success());
        assert_eq!(meta.content_type(), Some("application/json"));
        assert_eq!(meta.content_length(), Some(42));
    }
}
