//! Tasks: one logical request, one transfer, one ordered handler chain

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::auth::{AuthenticationHandler, Challenge, Disposition};
use crate::client::{Client, ClientInner};
use crate::error::{ClientResult, TaskError, TransportError};
use crate::pipeline::SerialQueue;
use crate::request::{CachePolicy, ParameterEncoding, Request, RequestBuilder};
use crate::response::{Outcome, Response, ResponseMeta};
use crate::transport::{TransferId, TransferKind, TransferSpec};

/// Lifecycle of a task. Draining is observed through [`Task::is_drained`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Created,
    Started,
    Resolved,
}

/// Result of [`Task::resume_and_wait`]
#[derive(Debug, Clone)]
pub enum WaitStatus {
    /// Every handler enqueued before the call has run
    Completed(Outcome),
    /// The timeout elapsed first and the task was cancelled
    TimedOut,
}

impl WaitStatus {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitStatus::TimedOut)
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            WaitStatus::Completed(outcome) => Some(outcome),
            WaitStatus::TimedOut => None,
        }
    }
}

/// What the transport reported when a transfer finished
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub meta: Option<ResponseMeta>,
    pub body: Bytes,
    pub file: Option<std::path::PathBuf>,
    pub error: Option<TaskError>,
}

impl Completion {
    pub fn failed(error: TaskError) -> Self {
        Self { error: Some(error), ..Default::default() }
    }
}

struct TaskState {
    phase: TaskPhase,
    transfer: Option<TransferId>,
    outcome: Outcome,
    response: Response,
    auth_attempts: u32,
    cancel_requested: bool,
}

pub(crate) struct TaskShared {
    id: Uuid,
    kind: TransferKind,
    request: Request,
    client: Weak<ClientInner>,
    state: Mutex<TaskState>,
    pipeline: Arc<SerialQueue>,
}

impl TaskShared {
    /// Store the transfer's result and open the handler gate. Only the
    /// first resolution counts.
    pub(crate) fn resolve(&self, completion: Completion) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase == TaskPhase::Resolved {
                return false;
            }
            state.phase = TaskPhase::Resolved;
            state.response = Response {
                meta: completion.meta,
                body: completion.body,
                file: completion.file,
            };
            match completion.error {
                Some(err) => {
                    tracing::debug!(task_id = %self.id, error = %err, "Task resolved with failure");
                    state.outcome.fail(err);
                }
                None => {
                    tracing::debug!(task_id = %self.id, "Task resolved");
                    state.outcome.succeed();
                }
            }
        }
        self.pipeline.release();
        true
    }

    /// Run the client's authentication handler for a challenge on this task
    pub(crate) fn authenticate(
        &self,
        challenge: &Challenge,
        handler: Option<Arc<dyn AuthenticationHandler>>,
        max_retry: u32,
    ) -> Disposition {
        let Some(handler) = handler else {
            return Disposition::PerformDefaultHandling;
        };

        if challenge.kind.is_retry_capped() {
            let mut state = self.state.lock();
            if max_retry != 0 && state.auth_attempts >= max_retry {
                tracing::debug!(
                    task_id = %self.id,
                    kind = %challenge.kind,
                    attempts = state.auth_attempts,
                    "Authentication retry limit reached"
                );
                return Disposition::PerformDefaultHandling;
            }
            state.auth_attempts += 1;
        }

        match handler.handle(challenge) {
            Ok(disposition) => disposition,
            Err(err) => {
                tracing::debug!(task_id = %self.id, error = %err, "Authentication handler rejected challenge");
                self.state.lock().outcome.fail(err);
                Disposition::CancelAuthenticationChallenge
            }
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }
}

/// A single request/response unit.
///
/// Handlers attached with `on_*` are queued and run, in attachment order,
/// once the transfer has resolved. The client only references the task
/// weakly. Once resumed, the task's pipeline keeps it alive until every
/// queued handler has run, so the handle may be dropped right after
/// [`Task::resume`]. A task dropped before it is resumed is discarded along
/// with its handlers.
#[derive(Clone)]
#[must_use = "a task does nothing until resumed"]
pub struct Task {
    shared: Arc<TaskShared>,
}

impl Task {
    pub(crate) fn new(client: &Client, kind: TransferKind, request: Request) -> Self {
        let id = Uuid::new_v4();
        let pipeline = SerialQueue::held(format!("task-{}", id.simple()), client.executor().clone());
        Self {
            shared: Arc::new(TaskShared {
                id,
                kind,
                request,
                client: Arc::downgrade(client.inner()),
                state: Mutex::new(TaskState {
                    phase: TaskPhase::Created,
                    transfer: None,
                    outcome: Outcome::Unset,
                    response: Response::default(),
                    auth_attempts: 0,
                    cancel_requested: false,
                }),
                pipeline,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn kind(&self) -> TransferKind {
        self.shared.kind
    }

    pub fn request(&self) -> &Request {
        &self.shared.request
    }

    pub fn phase(&self) -> TaskPhase {
        self.shared.state.lock().phase
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        self.shared.state.lock().transfer
    }

    pub fn outcome(&self) -> Outcome {
        self.shared.state.lock().outcome.clone()
    }

    /// Snapshot of the buffered response
    pub fn response(&self) -> Response {
        self.shared.state.lock().response.clone()
    }

    pub fn auth_attempts(&self) -> u32 {
        self.shared.state.lock().auth_attempts
    }

    /// Resolved and every handler attached so far has run
    pub fn is_drained(&self) -> bool {
        self.shared.pipeline.is_drained()
    }

    /// Queue a handler that sees the raw response. Skipped if the task has
    /// already failed; an `Err` turns the outcome into a failure.
    pub fn on_response<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(&Response) -> Result<(), TaskError> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        self.shared.pipeline.enqueue(Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let response = {
                let state = shared.state.lock();
                if state.outcome.is_failure() {
                    tracing::trace!(task_id = %shared.id, "Skipping response handler after failure");
                    return;
                }
                state.response.clone()
            };

            let result = handler(&response);
            if let Err(err) = &result {
                tracing::debug!(task_id = %shared.id, error = %err, "Response handler reported failure");
            }
            shared.state.lock().outcome.apply(result);
        }));
        self.keep_alive_if_started();
        self
    }

    /// Queue a handler that receives the body decoded as JSON. A body that
    /// does not decode fails the task.
    pub fn on_json<T, F>(&self, handler: F) -> &Self
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> Result<(), TaskError> + Send + 'static,
    {
        self.on_response(move |response| handler(response.json::<T>()?))
    }

    /// Queue a handler that receives the relocated download. Fails the task
    /// with [`TaskError::MissingFile`] when no file was delivered.
    pub fn on_file<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(&Path, Option<&ResponseMeta>) -> Result<(), TaskError> + Send + 'static,
    {
        self.on_response(move |response| match response.file() {
            Some(file) => handler(file, response.meta.as_ref()),
            None => Err(TaskError::MissingFile),
        })
    }

    /// Queue a handler that runs only if the task has failed by the time it
    /// is reached.
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        self.shared.pipeline.enqueue(Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let error = match &shared.state.lock().outcome {
                Outcome::Failure(err) => Arc::clone(err),
                _ => return,
            };
            handler(&error);
        }));
        self.keep_alive_if_started();
        self
    }

    /// Install `handler` as the owning client's authentication handler
    pub fn authenticate<H>(&self, handler: H) -> &Self
    where
        H: AuthenticationHandler + 'static,
    {
        if let Some(client) = self.shared.client.upgrade() {
            client.set_authentication_handler(Arc::new(handler));
        }
        self
    }

    /// Start the transfer (first call) or resume a suspended one, and return
    /// without waiting.
    pub fn resume(&self) -> &Self {
        let Some(client) = self.shared.client.upgrade() else {
            self.shared.resolve(Completion::failed(TaskError::ClientReleased));
            return self;
        };

        enum Step {
            Start,
            Resume(TransferId),
            CancelledEarly,
            Nothing,
        }

        let step = {
            let mut state = self.shared.state.lock();
            match state.phase {
                TaskPhase::Created if state.cancel_requested => Step::CancelledEarly,
                TaskPhase::Created => {
                    state.phase = TaskPhase::Started;
                    Step::Start
                }
                TaskPhase::Started => state.transfer.map(Step::Resume).unwrap_or(Step::Nothing),
                TaskPhase::Resolved => Step::Nothing,
            }
        };

        if matches!(step, Step::Start | Step::CancelledEarly) {
            self.keep_alive();
        }
        match step {
            Step::Start => self.start(&client),
            Step::Resume(id) => client.transport().resume(id),
            Step::CancelledEarly => {
                self.shared.resolve(Completion::failed(TransportError::Cancelled.into()));
            }
            Step::Nothing => {}
        }
        self
    }

    /// Hand the pipeline a strong reference it drops once drained
    fn keep_alive(&self) {
        self.shared.pipeline.retain(Box::new(Arc::clone(&self.shared)));
    }

    fn keep_alive_if_started(&self) {
        if self.phase() != TaskPhase::Created {
            self.keep_alive();
        }
    }

    fn start(&self, client: &Arc<ClientInner>) {
        let spec = TransferSpec { kind: self.shared.kind, request: self.shared.request.clone() };
        let id = match client.transport().start_transfer(spec, client.event_sink()) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(task_id = %self.shared.id, error = %err, "Transport refused transfer");
                self.shared.resolve(Completion::failed(err.into()));
                return;
            }
        };

        if let Err(err) = client
            .registry()
            .register(id, self.shared.kind, Arc::downgrade(&self.shared))
        {
            self.shared.resolve(Completion::failed(err.into()));
            client.transport().cancel(id);
            return;
        }

        let cancel_requested = {
            let mut state = self.shared.state.lock();
            state.transfer = Some(id);
            state.cancel_requested
        };
        tracing::debug!(
            task_id = %self.shared.id,
            transfer_id = %id,
            kind = %self.shared.kind,
            method = %self.shared.request.method,
            url = %self.shared.request.url,
            "Transfer started"
        );

        if cancel_requested {
            client.transport().cancel(id);
        } else {
            client.transport().resume(id);
        }
    }

    /// Resume, then block until every handler attached before this call has
    /// run. A zero `timeout` waits without bound; otherwise the task is
    /// cancelled when the timeout elapses and the call returns immediately.
    pub fn resume_and_wait(&self, timeout: Duration) -> WaitStatus {
        let ticket = self.shared.pipeline.enqueued();
        self.resume();
        self.wait_for(ticket, timeout)
    }

    /// Like [`Task::resume_and_wait`] without resuming
    pub fn wait(&self, timeout: Duration) -> WaitStatus {
        let ticket = self.shared.pipeline.enqueued();
        self.wait_for(ticket, timeout)
    }

    fn wait_for(&self, ticket: u64, timeout: Duration) -> WaitStatus {
        let bound = if timeout.is_zero() { None } else { Some(timeout) };
        if self.shared.pipeline.wait_for(ticket, bound) {
            return WaitStatus::Completed(self.outcome());
        }
        tracing::warn!(
            task_id = %self.shared.id,
            timeout_ms = timeout.as_millis() as u64,
            "Wait timed out, cancelling task"
        );
        self.cancel();
        WaitStatus::TimedOut
    }

    pub fn suspend(&self) {
        let transfer = self.shared.state.lock().transfer;
        if let (Some(id), Some(client)) = (transfer, self.shared.client.upgrade()) {
            client.transport().suspend(id);
        }
    }

    /// Request transport-level abort. Safe at any stage; repeated calls and
    /// calls after completion do nothing.
    pub fn cancel(&self) {
        let transfer = {
            let mut state = self.shared.state.lock();
            state.cancel_requested = true;
            match state.phase {
                TaskPhase::Resolved => None,
                _ => state.transfer,
            }
        };
        if let (Some(id), Some(client)) = (transfer, self.shared.client.upgrade()) {
            tracing::debug!(task_id = %self.shared.id, transfer_id = %id, "Cancelling transfer");
            client.transport().cancel(id);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("method", &self.shared.request.method)
            .field("url", &self.shared.request.url.as_str())
            .field("phase", &state.phase)
            .field("transfer", &state.transfer)
            .field("outcome", &state.outcome)
            .finish()
    }
}

/// By-value builder for a [`Task`]. The request is frozen by [`TaskBuilder::build`].
#[derive(Debug)]
pub struct TaskBuilder {
    client: Client,
    kind: TransferKind,
    request: RequestBuilder,
}

impl TaskBuilder {
    pub(crate) fn new(client: Client, method: Method, path: &str) -> Self {
        let request = RequestBuilder::new(method, client.base_url().clone()).path(path);
        Self { client, kind: TransferKind::Data, request }
    }

    pub fn kind(mut self, kind: TransferKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn path(mut self, path: impl AsRef<str>) -> Self {
        self.request = self.request.path(path);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.request = self.request.query(name, value);
        self
    }

    pub fn query_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.request = self.request.query_params(params);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request = self.request.header(name, value);
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.request = self.request.headers(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request = self.request.body(body);
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.request = self.request.json(value);
        self
    }

    pub fn form_param(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.request = self.request.form_param(name, value);
        self
    }

    pub fn form<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsonValue>,
    {
        self.request = self.request.form(params);
        self
    }

    pub fn encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.request = self.request.encoding(encoding);
        self
    }

    pub fn soap(mut self, xml: &str) -> Self {
        self.request = self.request.soap(xml);
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request = self.request.cache_policy(policy);
        self
    }

    pub fn build(self) -> ClientResult<Task> {
        let request = self
            .client
            .config()
            .default_headers
            .iter()
            .fold(self.request, |request, (name, value)| request.default_header(name, value))
            .build()?;
        Ok(Task::new(&self.client, self.kind, request))
    }
}
