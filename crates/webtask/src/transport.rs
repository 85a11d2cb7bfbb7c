//! Transport Source contract
//!
//! A transport performs the actual network operation and reports progress
//! through an [`EventSink`]. The core never talks to sockets itself; it
//! starts transfers, arbitrates their completion, and routes callbacks back
//! to the owning task.

use std::fmt;
use std::path::Path;
use std::sync::Weak;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::auth::{Challenge, Disposition};
use crate::error::TransportError;
use crate::request::Request;
use crate::response::ResponseMeta;

/// Transport-assigned identifier of a single transfer, unique per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of transfer a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    #[default]
    Data,
    Download,
    Upload,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Data => write!(f, "data"),
            TransferKind::Download => write!(f, "download"),
            TransferKind::Upload => write!(f, "upload"),
        }
    }
}

/// Everything a transport needs to start a transfer
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub kind: TransferKind,
    pub request: Request,
}

/// A network transport the client drives.
///
/// `start_transfer` must create the transfer in a suspended state: no
/// callback may be delivered for it until [`Transport::resume`] is called,
/// so the client can register the identifier first.
///
/// Callback ordering per transfer: zero or more challenges, zero or more
/// data chunks, at most one `download_finished` (downloads only), then
/// exactly one `completed`.
pub trait Transport: Send + Sync {
    fn start_transfer(
        &self,
        spec: TransferSpec,
        events: EventSink,
    ) -> Result<TransferId, TransportError>;

    fn resume(&self, id: TransferId);

    fn suspend(&self, id: TransferId);

    /// Abort a transfer. Must be a no-op for finished or unknown transfers.
    fn cancel(&self, id: TransferId);

    /// Cancel everything and refuse new transfers
    fn invalidate_and_cancel_all(&self);

    fn start_data_transfer(
        &self,
        request: Request,
        events: EventSink,
    ) -> Result<TransferId, TransportError> {
        self.start_transfer(TransferSpec { kind: TransferKind::Data, request }, events)
    }

    fn start_download_transfer(
        &self,
        request: Request,
        events: EventSink,
    ) -> Result<TransferId, TransportError> {
        self.start_transfer(TransferSpec { kind: TransferKind::Download, request }, events)
    }

    fn start_upload_transfer(
        &self,
        request: Request,
        events: EventSink,
    ) -> Result<TransferId, TransportError> {
        self.start_transfer(TransferSpec { kind: TransferKind::Upload, request }, events)
    }
}

/// Receiver of transport callbacks. Implemented by the client; exposed so
/// transports can be exercised in isolation.
pub trait TransferEvents: Send + Sync {
    fn data_received(&self, id: TransferId, chunk: Bytes);

    fn challenge(&self, id: TransferId, challenge: &Challenge) -> Disposition;

    /// The payload is at `location` until this call returns
    fn download_finished(&self, id: TransferId, location: &Path);

    fn completed(&self, id: TransferId, meta: Option<ResponseMeta>, error: Option<TransportError>);

    fn events_finished(&self) {}
}

/// Non-owning handle a transport uses to deliver callbacks.
///
/// Once the receiving client has been dropped every method is a no-op, and
/// `challenge` answers [`Disposition::PerformDefaultHandling`].
#[derive(Clone)]
pub struct EventSink {
    target: Weak<dyn TransferEvents>,
}

impl EventSink {
    pub fn new(target: Weak<dyn TransferEvents>) -> Self {
        Self { target }
    }

    pub fn is_connected(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub fn data_received(&self, id: TransferId, chunk: Bytes) {
        if let Some(target) = self.target.upgrade() {
            target.data_received(id, chunk);
        }
    }

    pub fn challenge(&self, id: TransferId, challenge: &Challenge) -> Disposition {
        match self.target.upgrade() {
            Some(target) => target.challenge(id, challenge),
            None => Disposition::PerformDefaultHandling,
        }
    }

    pub fn download_finished(&self, id: TransferId, location: &Path) {
        if let Some(target) = self.target.upgrade() {
            target.download_finished(id, location);
        }
    }

    pub fn completed(
        &self,
        id: TransferId,
        meta: Option<ResponseMeta>,
        error: Option<TransportError>,
    ) {
        if let Some(target) = self.target.upgrade() {
            target.completed(id, meta, error);
        } else {
            tracing::debug!(transfer_id = %id, "Dropping completion, client released");
        }
    }

    pub fn events_finished(&self) {
        if let Some(target) = self.target.upgrade() {
            target.events_finished();
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}
