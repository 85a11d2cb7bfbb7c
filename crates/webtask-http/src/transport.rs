//! reqwest implementation of [`webtask::Transport`]
//!
//! Each transfer runs as one tokio task. It is created suspended and waits
//! on a watch channel until resumed; suspend pauses it between body chunks
//! and cancel aborts it wherever it is. Callbacks that may block (challenge
//! handling, download relocation, completion) are delivered from the
//! blocking pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use http::header::{CACHE_CONTROL, WWW_AUTHENTICATE};
use http::StatusCode;
use parking_lot::Mutex;
use reqwest::Client;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use webtask::{
    Challenge, ChallengeKind, Credential, Disposition, EventSink, Executor, Request, ResponseMeta,
    TransferId, TransferKind, TransferSpec, Transport, TransportError,
};

use crate::config::HttpConfig;
use crate::error::HttpResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Suspended,
    Running,
    Cancelled,
}

struct TransferHandle {
    control: watch::Sender<Control>,
    finished: Arc<AtomicBool>,
    events: EventSink,
}

struct Inner {
    client: Client,
    config: HttpConfig,
    executor: Executor,
    transient_root: TempDir,
    next_id: AtomicU64,
    invalidated: AtomicBool,
    transfers: Mutex<HashMap<TransferId, TransferHandle>>,
}

impl Inner {
    /// Deliver the terminal callback. The first caller wins; later calls for
    /// the same transfer do nothing.
    fn finish(&self, id: TransferId, meta: Option<ResponseMeta>, error: Option<TransportError>) {
        let Some(handle) = self.transfers.lock().remove(&id) else {
            return;
        };
        if handle.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        handle.control.send_replace(Control::Cancelled);

        match &error {
            Some(err) => tracing::debug!(transfer_id = %id, error = %err, "HTTP transfer failed"),
            None => tracing::debug!(
                transfer_id = %id,
                status = meta.as_ref().map(|m| m.status.as_u16()).unwrap_or_default(),
                "HTTP transfer finished"
            ),
        }
        handle.events.completed(id, meta, error);
        handle.events.events_finished();
    }
}

/// Network transport backed by a shared `reqwest::Client`
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> HttpResult<Self> {
        let executor = Executor::current_or_owned("webtask-http")?;
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: HttpConfig, executor: Executor) -> HttpResult<Self> {
        let client = config.build_client()?;
        let transient_root = match &config.transient_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::Builder::new().prefix("webtask-").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("webtask-").tempdir()?,
        };
        tracing::debug!(
            transient_dir = %transient_root.path().display(),
            connect_timeout_ms = config.connect_timeout_ms,
            total_timeout_ms = config.total_timeout_ms,
            "HTTP transport created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                executor,
                transient_root,
                next_id: AtomicU64::new(0),
                invalidated: AtomicBool::new(false),
                transfers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.inner.config
    }

    pub fn active_transfers(&self) -> usize {
        self.inner.transfers.lock().len()
    }

    fn set_control(&self, id: TransferId, from: Control, to: Control) {
        if let Some(handle) = self.inner.transfers.lock().get(&id) {
            handle.control.send_if_modified(|state| {
                if *state == from {
                    *state = to;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl Transport for HttpTransport {
    fn start_transfer(&self, spec: TransferSpec, events: EventSink) -> Result<TransferId, TransportError> {
        if self.inner.invalidated.load(Ordering::SeqCst) {
            return Err(TransportError::Invalidated);
        }

        let id = TransferId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (control, control_rx) = watch::channel(Control::Suspended);
        let finished = Arc::new(AtomicBool::new(false));
        self.inner.transfers.lock().insert(
            id,
            TransferHandle { control, finished: Arc::clone(&finished), events: events.clone() },
        );

        let transfer = TransferRun {
            inner: Arc::clone(&self.inner),
            id,
            spec,
            control: control_rx,
            finished,
            events,
        };
        self.inner.executor.spawn(transfer.run());
        Ok(id)
    }

    fn resume(&self, id: TransferId) {
        self.set_control(id, Control::Suspended, Control::Running);
    }

    fn suspend(&self, id: TransferId) {
        self.set_control(id, Control::Running, Control::Suspended);
    }

    fn cancel(&self, id: TransferId) {
        self.inner.finish(id, None, Some(TransportError::Cancelled));
    }

    fn invalidate_and_cancel_all(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
        let ids: Vec<TransferId> = self.inner.transfers.lock().keys().copied().collect();
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "Cancelling HTTP transfers on invalidation");
        }
        for id in ids {
            self.cancel(id);
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("active_transfers", &self.active_transfers())
            .field("invalidated", &self.inner.invalidated.load(Ordering::SeqCst))
            .finish()
    }
}

/// State owned by one running transfer
struct TransferRun {
    inner: Arc<Inner>,
    id: TransferId,
    spec: TransferSpec,
    control: watch::Receiver<Control>,
    finished: Arc<AtomicBool>,
    events: EventSink,
}

impl TransferRun {
    async fn run(mut self) {
        if !wait_running(&mut self.control).await {
            return;
        }
        tracing::debug!(
            transfer_id = %self.id,
            method = %self.spec.request.method,
            url = %self.spec.request.url,
            "HTTP transfer running"
        );

        let total = self.inner.config.total_timeout();
        let mut cancelled = self.control.clone();
        let result = tokio::select! {
            result = tokio::time::timeout(total, self.perform()) => match result {
                Ok(result) => result,
                Err(_) => Err(TransportError::TimedOut(format!(
                    "transfer exceeded {}ms (total timeout)",
                    total.as_millis()
                ))),
            },
            _ = wait_cancelled(&mut cancelled) => return,
        };

        let (meta, error) = match result {
            Ok(meta) => (Some(meta), None),
            Err(err) => (None, Some(err)),
        };
        let inner = Arc::clone(&self.inner);
        let id = self.id;
        if tokio::task::spawn_blocking(move || inner.finish(id, meta, error)).await.is_err() {
            tracing::error!(transfer_id = %id, "Completion callback panicked");
        }
    }

    async fn perform(&mut self) -> Result<ResponseMeta, TransportError> {
        let mut credential: Option<Credential> = None;
        let mut rounds = 0u32;

        let response = loop {
            let response = self
                .build_request(credential.as_ref())
                .send()
                .await
                .map_err(classify)?;

            if response.status() != StatusCode::UNAUTHORIZED
                || rounds >= self.inner.config.max_challenge_rounds
            {
                break response;
            }
            let Some(challenge) = challenge_from(&response, rounds) else {
                break response;
            };

            let events = self.events.clone();
            let id = self.id;
            let disposition = blocking(move || events.challenge(id, &challenge)).await?;
            match disposition {
                Disposition::UseCredential(next) => {
                    credential = Some(next);
                    rounds += 1;
                }
                Disposition::CancelAuthenticationChallenge => return Err(TransportError::Cancelled),
                Disposition::PerformDefaultHandling | Disposition::RejectProtectionSpace => {
                    break response;
                }
            }
        };

        let meta = ResponseMeta::new(response.status())
            .with_headers(response.headers().clone())
            .with_url(response.url().to_string());

        match self.spec.kind {
            TransferKind::Data | TransferKind::Upload => self.stream_body(response).await?,
            TransferKind::Download => self.download(response).await?,
        }
        Ok(meta)
    }

    fn build_request(&self, credential: Option<&Credential>) -> reqwest::RequestBuilder {
        let request: &Request = &self.spec.request;
        let mut builder = self
            .inner
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(self.inner.config.request_timeout());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        // An explicit Cache-Control header wins over the request's policy
        if let Some(directive) = request.cache_policy.cache_control() {
            if !request.headers.contains_key(CACHE_CONTROL) {
                builder = builder.header(CACHE_CONTROL, directive);
            }
        }
        match credential {
            Some(Credential::Basic { username, password }) => builder.basic_auth(username, Some(password)),
            Some(Credential::Bearer(token)) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn checkpoint(&mut self) -> Result<(), TransportError> {
        if self.finished.load(Ordering::SeqCst) || !wait_running(&mut self.control).await {
            return Err(TransportError::Cancelled);
        }
        Ok(())
    }

    async fn stream_body(&mut self, response: reqwest::Response) -> Result<(), TransportError> {
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            self.checkpoint().await?;
            self.events.data_received(self.id, chunk);
        }
        Ok(())
    }

    async fn download(&mut self, response: reqwest::Response) -> Result<(), TransportError> {
        let staging = tempfile::Builder::new()
            .prefix("transfer-")
            .tempdir_in(self.inner.transient_root.path())?;
        let location = staging.path().join(transient_file_name(response.url()));

        let mut file = tokio::fs::File::create(&location).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            self.checkpoint().await?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let events = self.events.clone();
        let id = self.id;
        blocking(move || events.download_finished(id, &location)).await?;

        // The staged copy is only valid for the duration of the callback
        drop(staging);
        Ok(())
    }
}

async fn blocking<F, R>(callback: F) -> Result<R, TransportError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(callback)
        .await
        .map_err(|e| TransportError::Other(format!("callback failed: {}", e)))
}

/// Wait until the transfer is running. Returns false once cancelled.
async fn wait_running(control: &mut watch::Receiver<Control>) -> bool {
    loop {
        let state = *control.borrow_and_update();
        match state {
            Control::Running => return true,
            Control::Cancelled => return false,
            Control::Suspended => {}
        }
        if control.changed().await.is_err() {
            return false;
        }
    }
}

async fn wait_cancelled(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() == Control::Cancelled {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::TimedOut(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

fn challenge_from(response: &reqwest::Response, rounds: u32) -> Option<Challenge> {
    let header = response.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;
    let mut challenge = Challenge::new(ChallengeKind::from_header(header)).with_previous_failures(rounds);
    if let Some(realm) = parse_realm(header) {
        challenge = challenge.with_realm(realm);
    }
    if let Some(host) = response.url().host_str() {
        challenge = challenge.with_host(host);
    }
    Some(challenge)
}

/// Extract `realm="..."` from a `WWW-Authenticate` value
fn parse_realm(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &header[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split(|c: char| c == ',' || c.is_whitespace()).next()?,
    };
    Some(realm.to_string())
}

fn transient_file_name(url: &url::Url) -> PathBuf {
    let name = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .filter(|name| !name.contains(['/', '\\']) && *name != ".." && *name != ".")
        .unwrap_or("download");
    Path::new(name).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_realm() {
        assert_eq!(parse_realm(r#"Basic realm="api users""#).as_deref(), Some("api users"));
        assert_eq!(parse_realm(r#"Digest Realm=internal, nonce="x""#).as_deref(), Some("internal"));
        assert_eq!(parse_realm("Bearer"), None);
    }

    #[test]
    fn test_transient_file_name() {
        let url = url::Url::parse("https://files.example.com/exports/file.zip?sig=1").unwrap();
        assert_eq!(transient_file_name(&url), PathBuf::from("file.zip"));

        let url = url::Url::parse("https://files.example.com/").unwrap();
        assert_eq!(transient_file_name(&url), PathBuf::from("download"));
    }

    #[tokio::test]
    async fn test_wait_running_observes_cancel() {
        let (tx, mut rx) = watch::channel(Control::Suspended);
        let waiter = tokio::spawn(async move { wait_running(&mut rx).await });
        tx.send_replace(Control::Cancelled);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_running_resumes() {
        let (tx, mut rx) = watch::channel(Control::Suspended);
        let waiter = tokio::spawn(async move { wait_running(&mut rx).await });
        tx.send_replace(Control::Running);
        assert!(waiter.await.unwrap());
    }
}
