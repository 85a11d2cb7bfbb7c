//! Client-side HTTP task layer.
//!
//! A [`Client`] starts transfers on a [`Transport`] and routes the
//! transport's callbacks back to the [`Task`] that owns each transfer. Every
//! task carries an ordered pipeline of handlers that stays closed until the
//! transfer resolves, and can be awaited synchronously with
//! [`Task::resume_and_wait`].

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod mock;
pub mod pipeline;
pub mod registry;
pub mod relocation;
pub mod request;
pub mod response;
pub mod task;
pub mod transport;

pub use auth::{AuthenticationHandler, Challenge, ChallengeKind, Credential, Disposition, StaticCredentials};
pub use client::{BackgroundCompletionHandler, Client, ClientBuilder};
pub use config::{ClientConfig, FileFormat};
pub use error::{
    ClientError, ClientResult, RegistryError, RelocationError, TaskError, TransportError,
};
pub use executor::Executor;
pub use request::{CachePolicy, ParameterEncoding, Request, RequestBuilder};
pub use response::{Outcome, Response, ResponseMeta};
pub use task::{Task, TaskBuilder, TaskPhase, WaitStatus};
pub use transport::{EventSink, TransferEvents, TransferId, TransferKind, TransferSpec, Transport};
