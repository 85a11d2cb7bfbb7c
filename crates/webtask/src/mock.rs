//! In-memory transport for tests and embedders
//!
//! [`MockTransport`] records every transfer it is asked to start and lets the
//! caller drive callbacks by hand, or answers automatically through a
//! responder closure that runs on a background thread once a transfer is
//! first resumed.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

use crate::auth::{Challenge, Disposition};
use crate::error::TransportError;
use crate::request::{content_type, Request};
use crate::response::ResponseMeta;
use crate::transport::{EventSink, TransferId, TransferKind, TransferSpec, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockState {
    Suspended,
    Running,
    Finished,
    Cancelled,
}

impl MockState {
    fn is_live(self) -> bool {
        matches!(self, MockState::Suspended | MockState::Running)
    }
}

/// Snapshot of a recorded transfer
#[derive(Debug, Clone)]
pub struct MockTransfer {
    pub id: TransferId,
    pub kind: TransferKind,
    pub request: Request,
    pub state: MockState,
    /// Answers the client gave to challenges, in order
    pub dispositions: Vec<Disposition>,
}

/// Scripted answer produced by a responder
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
    /// Payload handed over through `download_finished` for downloads
    pub file: Option<Bytes>,
    pub error: Option<TransportError>,
    pub challenges: Vec<Challenge>,
    pub delay: Duration,
}

impl MockReply {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            file: None,
            error: None,
            challenges: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    /// `200 OK` with `body` delivered as a single chunk
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(StatusCode::OK).with_chunk(body)
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::ok(value.to_string()).with_header(CONTENT_TYPE, HeaderValue::from_static(content_type::JSON))
    }

    /// Transport-level failure with no response
    pub fn error(error: TransportError) -> Self {
        Self { error: Some(error), ..Self::status(StatusCode::OK) }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        self
    }

    pub fn with_file(mut self, contents: impl Into<Bytes>) -> Self {
        self.file = Some(contents.into());
        self
    }

    pub fn with_challenge(mut self, challenge: Challenge) -> Self {
        self.challenges.push(challenge);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Arc<dyn Fn(&MockTransfer) -> MockReply + Send + Sync>;

struct Entry {
    kind: TransferKind,
    request: Request,
    events: EventSink,
    state: MockState,
    resumed_once: bool,
    dispositions: Vec<Disposition>,
}

impl Entry {
    fn snapshot(&self, id: TransferId) -> MockTransfer {
        MockTransfer {
            id,
            kind: self.kind,
            request: self.request.clone(),
            state: self.state,
            dispositions: self.dispositions.clone(),
        }
    }
}

struct MockInner {
    next_id: AtomicU64,
    invalidated: AtomicBool,
    transfers: Mutex<HashMap<TransferId, Entry>>,
    started: Condvar,
    responder: Option<Responder>,
    transient_dir: TempDir,
}

/// Cloneable handle; clones share the same recorded transfers
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    /// Transport whose callbacks are driven by hand
    pub fn new() -> std::io::Result<Self> {
        Self::build(None)
    }

    /// Transport that answers every transfer with `responder`
    pub fn with_responder<F>(responder: F) -> std::io::Result<Self>
    where
        F: Fn(&MockTransfer) -> MockReply + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(responder)))
    }

    fn build(responder: Option<Responder>) -> std::io::Result<Self> {
        Ok(Self {
            inner: Arc::new(MockInner {
                next_id: AtomicU64::new(0),
                invalidated: AtomicBool::new(false),
                transfers: Mutex::new(HashMap::new()),
                started: Condvar::new(),
                responder,
                transient_dir: tempfile::Builder::new().prefix("webtask-mock").tempdir()?,
            }),
        })
    }

    pub fn transfers(&self) -> Vec<MockTransfer> {
        let transfers = self.inner.transfers.lock();
        let mut snapshots: Vec<_> = transfers.iter().map(|(id, entry)| entry.snapshot(*id)).collect();
        snapshots.sort_by_key(|transfer| transfer.id);
        snapshots
    }

    pub fn transfer(&self, id: TransferId) -> Option<MockTransfer> {
        self.inner.transfers.lock().get(&id).map(|entry| entry.snapshot(id))
    }

    pub fn last_transfer(&self) -> Option<MockTransfer> {
        self.transfers().pop()
    }

    pub fn started(&self) -> usize {
        self.inner.transfers.lock().len()
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::SeqCst)
    }

    /// Block until at least `count` transfers have been started
    pub fn wait_for_transfers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut transfers = self.inner.transfers.lock();
        while transfers.len() < count {
            if self.inner.started.wait_until(&mut transfers, deadline).timed_out() {
                return transfers.len() >= count;
            }
        }
        true
    }

    fn live_sink(&self, id: TransferId) -> Option<EventSink> {
        let transfers = self.inner.transfers.lock();
        transfers
            .get(&id)
            .filter(|entry| entry.state.is_live())
            .map(|entry| entry.events.clone())
    }

    /// Move a live transfer to a terminal state, returning its sink
    fn finish(&self, id: TransferId, state: MockState) -> Option<EventSink> {
        let mut transfers = self.inner.transfers.lock();
        let entry = transfers.get_mut(&id)?;
        if !entry.state.is_live() {
            return None;
        }
        entry.state = state;
        Some(entry.events.clone())
    }

    /// Deliver a data chunk. Returns false if the transfer is not live.
    pub fn deliver_data(&self, id: TransferId, chunk: impl Into<Bytes>) -> bool {
        match self.live_sink(id) {
            Some(events) => {
                events.data_received(id, chunk.into());
                true
            }
            None => false,
        }
    }

    /// Issue a challenge and record the client's answer
    pub fn challenge(&self, id: TransferId, challenge: &Challenge) -> Option<Disposition> {
        let events = self.live_sink(id)?;
        let disposition = events.challenge(id, challenge);
        if let Some(entry) = self.inner.transfers.lock().get_mut(&id) {
            entry.dispositions.push(disposition.clone());
        }
        Some(disposition)
    }

    /// Write `contents` to a transient file, report it, then delete it
    pub fn finish_download(&self, id: TransferId, contents: &[u8]) -> std::io::Result<bool> {
        let Some((events, file_name)) = ({
            let transfers = self.inner.transfers.lock();
            transfers
                .get(&id)
                .filter(|entry| entry.state.is_live())
                .map(|entry| (entry.events.clone(), transient_file_name(&entry.request)))
        }) else {
            return Ok(false);
        };

        let dir = self.inner.transient_dir.path().join(id.0.to_string());
        fs::create_dir_all(&dir)?;
        let location: PathBuf = dir.join(file_name);
        fs::write(&location, contents)?;
        events.download_finished(id, &location);
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Deliver the terminal completion. Returns false if already finished.
    pub fn complete(&self, id: TransferId, meta: Option<ResponseMeta>, error: Option<TransportError>) -> bool {
        let state = match error {
            Some(TransportError::Cancelled) => MockState::Cancelled,
            _ => MockState::Finished,
        };
        match self.finish(id, state) {
            Some(events) => {
                events.completed(id, meta, error);
                events.events_finished();
                true
            }
            None => false,
        }
    }

    /// Play `reply` against a transfer: challenges, chunks, download, completion
    pub fn respond(&self, id: TransferId, reply: MockReply) {
        if !reply.delay.is_zero() {
            thread::sleep(reply.delay);
        }
        for challenge in &reply.challenges {
            if self.challenge(id, challenge).is_none() {
                return;
            }
        }
        if let Some(error) = reply.error {
            self.complete(id, None, Some(error));
            return;
        }

        let url = self.transfer(id).map(|transfer| transfer.request.url.to_string());
        let mut meta = ResponseMeta::new(reply.status).with_headers(reply.headers);
        if let Some(url) = url {
            meta = meta.with_url(url);
        }

        for chunk in reply.chunks {
            if !self.deliver_data(id, chunk) {
                return;
            }
        }
        if let Some(contents) = reply.file {
            if let Err(err) = self.finish_download(id, &contents) {
                self.complete(id, Some(meta), Some(TransportError::from(err)));
                return;
            }
        }
        self.complete(id, Some(meta), None);
    }
}

fn transient_file_name(request: &Request) -> String {
    request
        .url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .unwrap_or_else(|| "download.bin".to_string())
}

impl Transport for MockTransport {
    fn start_transfer(&self, spec: TransferSpec, events: EventSink) -> Result<TransferId, TransportError> {
        if self.is_invalidated() {
            return Err(TransportError::Invalidated);
        }
        let id = TransferId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut transfers = self.inner.transfers.lock();
        transfers.insert(
            id,
            Entry {
                kind: spec.kind,
                request: spec.request,
                events,
                state: MockState::Suspended,
                resumed_once: false,
                dispositions: Vec::new(),
            },
        );
        self.inner.started.notify_all();
        tracing::trace!(transfer_id = %id, kind = %spec.kind, "Mock transfer created");
        Ok(id)
    }

    fn resume(&self, id: TransferId) {
        let snapshot = {
            let mut transfers = self.inner.transfers.lock();
            let Some(entry) = transfers.get_mut(&id) else {
                return;
            };
            if entry.state != MockState::Suspended {
                return;
            }
            entry.state = MockState::Running;
            let first = !entry.resumed_once;
            entry.resumed_once = true;
            first.then(|| entry.snapshot(id))
        };

        if let (Some(snapshot), Some(responder)) = (snapshot, self.inner.responder.clone()) {
            let transport = self.clone();
            thread::spawn(move || {
                let reply = responder(&snapshot);
                transport.respond(snapshot.id, reply);
            });
        }
    }

    fn suspend(&self, id: TransferId) {
        if let Some(entry) = self.inner.transfers.lock().get_mut(&id) {
            if entry.state == MockState::Running {
                entry.state = MockState::Suspended;
            }
        }
    }

    fn cancel(&self, id: TransferId) {
        self.complete(id, None, Some(TransportError::Cancelled));
    }

    fn invalidate_and_cancel_all(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
        let live: Vec<TransferId> = self
            .inner
            .transfers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state.is_live())
            .map(|(id, _)| *id)
            .collect();
        for id in live {
            self.cancel(id);
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("started", &self.started())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
