//! Client: owns the transport, the transfer registry and the callback
//! dispatcher that routes transport events to tasks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use parking_lot::RwLock;
use url::Url;

use crate::auth::{AuthenticationHandler, Challenge, Disposition};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, TaskError, TransportError};
use crate::executor::Executor;
use crate::registry::TransferRegistry;
use crate::relocation::Relocator;
use crate::request::parse_base_url;
use crate::response::ResponseMeta;
use crate::task::{Completion, TaskBuilder, TaskShared};
use crate::transport::{EventSink, TransferEvents, TransferId, TransferKind, Transport};

/// Invoked when the transport reports that it has finished delivering
/// events for a transfer
pub type BackgroundCompletionHandler = Arc<dyn Fn() + Send + Sync>;

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    background_handler: Option<BackgroundCompletionHandler>,
    executor: Option<Executor>,
}

impl ClientBuilder {
    fn new(config: ClientConfig) -> Self {
        Self { config, transport: None, auth_handler: None, background_handler: None, executor: None }
    }

    /// Replace the configuration. A base URL already given to
    /// [`Client::builder`] wins over one missing from `config`.
    pub fn config(mut self, mut config: ClientConfig) -> Self {
        if config.base_url.is_none() {
            config.base_url = self.config.base_url.take();
        }
        self.config = config;
        self
    }

    pub fn transport<T: Transport + 'static>(self, transport: T) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn max_auth_retry(mut self, max: u32) -> Self {
        self.config.max_auth_retry = max;
        self
    }

    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.download_dir = dir.into();
        self
    }

    pub fn relocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.relocation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn authentication_handler<H: AuthenticationHandler + 'static>(mut self, handler: H) -> Self {
        self.auth_handler = Some(Arc::new(handler));
        self
    }

    pub fn background_completion_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.background_handler = Some(Arc::new(handler));
        self
    }

    /// Run handlers and relocations on this executor instead of the ambient
    /// runtime
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> ClientResult<Client> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| ClientError::Config("base_url is required".to_string()))
            .and_then(parse_base_url)?;
        let transport = self
            .transport
            .ok_or_else(|| ClientError::Config("no transport configured".to_string()))?;
        self.config.validate()?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => Executor::current_or_owned("webtask-worker")?,
        };
        let relocator = Relocator::new(
            self.config.download_dir.clone(),
            self.config.relocation_timeout(),
            executor.clone(),
        );

        tracing::debug!(
            base_url = %base_url,
            max_auth_retry = self.config.max_auth_retry,
            download_dir = %self.config.download_dir.display(),
            "Client created"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                max_auth_retry: AtomicU32::new(self.config.max_auth_retry),
                config: self.config,
                transport,
                registry: TransferRegistry::new(),
                auth_handler: RwLock::new(self.auth_handler),
                background_handler: RwLock::new(self.background_handler),
                relocator,
                executor,
            }),
        })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

/// Entry point for creating tasks against one base URL.
///
/// Cheap to clone. Tasks hold the client weakly: once every `Client` handle
/// is gone the transport is invalidated and in-flight tasks resolve with
/// [`TransportError::Invalidated`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(ClientConfig { base_url: Some(base_url.into()), ..Default::default() })
    }

    /// Builder seeded from a loaded configuration
    pub fn from_config(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn download_dir(&self) -> &Path {
        self.inner.relocator.download_dir()
    }

    pub fn request(&self, method: Method, path: &str) -> TaskBuilder {
        TaskBuilder::new(self.clone(), method, path)
    }

    pub fn head(&self, path: &str) -> TaskBuilder {
        self.request(Method::HEAD, path)
    }

    pub fn get(&self, path: &str) -> TaskBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> TaskBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> TaskBuilder {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> TaskBuilder {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> TaskBuilder {
        self.request(Method::DELETE, path)
    }

    /// GET whose payload is delivered as a file
    pub fn download(&self, path: &str) -> TaskBuilder {
        self.request(Method::GET, path).kind(TransferKind::Download)
    }

    pub fn upload(&self, method: Method, path: &str, body: impl Into<Bytes>) -> TaskBuilder {
        self.request(method, path).kind(TransferKind::Upload).body(body)
    }

    pub fn set_authentication_handler<H: AuthenticationHandler + 'static>(&self, handler: H) {
        self.inner.set_authentication_handler(Arc::new(handler));
    }

    pub fn clear_authentication_handler(&self) {
        *self.inner.auth_handler.write() = None;
    }

    pub fn max_auth_retry(&self) -> u32 {
        self.inner.max_auth_retry()
    }

    /// 0 disables the cap
    pub fn set_max_auth_retry(&self, max: u32) {
        self.inner.max_auth_retry.store(max, Ordering::SeqCst);
    }

    pub fn set_background_completion_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.background_handler.write() = Some(Arc::new(handler));
    }

    /// Transfers currently registered
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("in_flight", &self.inner.registry.len())
            .finish()
    }
}

pub(crate) struct ClientInner {
    base_url: Url,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    registry: TransferRegistry<TaskShared>,
    auth_handler: RwLock<Option<Arc<dyn AuthenticationHandler>>>,
    background_handler: RwLock<Option<BackgroundCompletionHandler>>,
    max_auth_retry: AtomicU32,
    relocator: Relocator,
    executor: Executor,
}

impl ClientInner {
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn registry(&self) -> &TransferRegistry<TaskShared> {
        &self.registry
    }

    pub(crate) fn event_sink(self: &Arc<Self>) -> EventSink {
        let target: std::sync::Weak<ClientInner> = Arc::downgrade(self);
        EventSink::new(target)
    }

    pub(crate) fn set_authentication_handler(&self, handler: Arc<dyn AuthenticationHandler>) {
        *self.auth_handler.write() = Some(handler);
    }

    fn max_auth_retry(&self) -> u32 {
        self.max_auth_retry.load(Ordering::SeqCst)
    }
}

impl TransferEvents for ClientInner {
    fn data_received(&self, id: TransferId, chunk: Bytes) {
        self.registry.append_data(id, &chunk);
    }

    fn challenge(&self, id: TransferId, challenge: &Challenge) -> Disposition {
        let Some(task) = self.registry.resolve(id) else {
            tracing::debug!(transfer_id = %id, kind = %challenge.kind, "Challenge for unknown transfer");
            return Disposition::PerformDefaultHandling;
        };
        let handler = self.auth_handler.read().clone();
        task.authenticate(challenge, handler, self.max_auth_retry())
    }

    fn download_finished(&self, id: TransferId, location: &Path) {
        if !self.registry.contains(id) {
            tracing::debug!(transfer_id = %id, "Download finished for unknown transfer");
            return;
        }

        let relocation = self.relocator.relocate(location);
        if !self.registry.attach_relocation(id, Arc::clone(&relocation)) {
            tracing::debug!(transfer_id = %id, "Transfer unregistered while relocating");
        }
        // The transient file is only valid until this callback returns
        if !relocation.wait_ready(self.relocator.wait_limit()) {
            tracing::warn!(
                transfer_id = %id,
                source = %location.display(),
                "Relocation still pending when transient file was released"
            );
        }
    }

    fn completed(&self, id: TransferId, meta: Option<ResponseMeta>, error: Option<TransportError>) {
        let Some(mut entry) = self.registry.unregister(id) else {
            tracing::debug!(transfer_id = %id, "Completion for unknown transfer");
            return;
        };
        let Some(task) = entry.task.upgrade() else {
            tracing::debug!(transfer_id = %id, "Task released before completion");
            return;
        };

        let mut completion = Completion {
            meta,
            body: entry.take_data(),
            file: None,
            error: error.map(TaskError::from),
        };

        match entry.kind {
            TransferKind::Download => {
                if let Some(relocation) = entry.take_relocation() {
                    match relocation.result(self.relocator.wait_limit()) {
                        Ok(path) => completion.file = Some(path),
                        Err(err) => {
                            if completion.error.is_none() {
                                completion.error = Some(err.into());
                            }
                        }
                    }
                }
            }
            TransferKind::Data | TransferKind::Upload => {}
        }

        tracing::debug!(
            transfer_id = %id,
            task_id = %task.id(),
            kind = %entry.kind,
            failed = completion.error.is_some(),
            "Transfer completed"
        );
        task.resolve(completion);
    }

    fn events_finished(&self) {
        let handler = self.background_handler.read().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.transport.invalidate_and_cancel_all();
        let entries = self.registry.drain();
        if !entries.is_empty() {
            tracing::debug!(in_flight = entries.len(), "Client released with transfers in flight");
        }
        for (_, entry) in entries {
            if let Some(task) = entry.task.upgrade() {
                task.resolve(Completion::failed(TransportError::Invalidated.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    #[test]
    fn test_builder_requires_transport() {
        let err = Client::builder("https://api.example.com").build().unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_builder_rejects_bad_base_url() {
        let err = Client::builder("not a url")
            .transport(MockTransport::new().unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl(_)));
    }

    #[test]
    fn test_config_keeps_builder_base_url() {
        let config = ClientConfig { max_auth_retry: 4, ..Default::default() };
        let client = Client::builder("https://api.example.com/v1")
            .config(config)
            .transport(MockTransport::new().unwrap())
            .build()
            .unwrap();
        assert_eq!(client.base_url().as_str(), "https://api.example.com/v1");
        assert_eq!(client.max_auth_retry(), 4);

        client.set_max_auth_retry(0);
        assert_eq!(client.max_auth_retry(), 0);
    }

    #[test]
    fn test_verbs_build_requests_against_base() {
        let client = Client::builder("https://api.example.com/v1")
            .default_header("Accept", "application/json")
            .transport(MockTransport::new().unwrap())
            .build()
            .unwrap();

        let task = client.delete("posts/3").build().unwrap();
        assert_eq!(task.request().method, Method::DELETE);
        assert_eq!(task.request().url.as_str(), "https://api.example.com/v1/posts/3");
        assert_eq!(task.request().headers["accept"], "application/json");

        let task = client.download("files/report.csv").build().unwrap();
        assert_eq!(task.kind(), TransferKind::Download);

        let task = client.upload(Method::PUT, "files/a.bin", &b"abc"[..]).build().unwrap();
        assert_eq!(task.kind(), TransferKind::Upload);
        assert_eq!(task.request().body.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_default_header_does_not_override_explicit_one() {
        let client = Client::builder("https://api.example.com")
            .default_header("Accept", "application/json")
            .transport(MockTransport::new().unwrap())
            .build()
            .unwrap();

        let task = client.get("feed").header("accept", "text/xml").build().unwrap();
        assert_eq!(task.request().headers.get_all("accept").iter().count(), 1);
        assert_eq!(task.request().headers["accept"], "text/xml");
    }
}
