//! Client sides of the Manager: the generator's link and the control handle

use historystore::HistoryRecord;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{ManagerMetrics, ManagerReply, ManagerRequest};
use crate::error::{CoordError, CoordResult};

/// The generator's end of the message contract
///
/// Every call blocks the current thread, so the generator must run on a
/// dedicated thread (e.g. `tokio::task::spawn_blocking`), never on an async
/// worker.
pub struct GeneratorLink {
    tx: mpsc::Sender<ManagerRequest>,
    rx: mpsc::Receiver<ManagerReply>,
}

impl GeneratorLink {
    pub fn new(tx: mpsc::Sender<ManagerRequest>, rx: mpsc::Receiver<ManagerReply>) -> Self {
        debug!("GeneratorLink::new: called");
        Self { tx, rx }
    }

    /// `Send(rows)`: hand rows to the Manager for dispatch
    pub fn send(&self, rows: Vec<HistoryRecord>) -> CoordResult<()> {
        debug!(count = rows.len(), "GeneratorLink::send: called");
        self.tx
            .blocking_send(ManagerRequest::Send { rows })
            .map_err(|_| CoordError::Channel("manager request channel closed".to_string()))
    }

    /// `Receive()`: block until the Manager delivers the next reply
    pub fn receive(&mut self) -> CoordResult<ManagerReply> {
        debug!("GeneratorLink::receive: called");
        self.rx
            .blocking_recv()
            .ok_or_else(|| CoordError::Channel("manager reply channel closed".to_string()))
    }

    /// Take a reply if one is already waiting
    pub fn try_receive(&mut self) -> CoordResult<Option<ManagerReply>> {
        match self.rx.try_recv() {
            Ok(reply) => Ok(Some(reply)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(CoordError::Channel("manager reply channel closed".to_string()))
            }
        }
    }

    /// Tell the Manager the generator is done and wait for it to exit
    ///
    /// Returns replies that were still queued, e.g. the `STOP` answer to a
    /// `Send` that crossed an earlier `STOP`. A Manager that already exited is
    /// fine.
    pub fn finish(&mut self) -> Vec<ManagerReply> {
        debug!("GeneratorLink::finish: called");
        if self.tx.blocking_send(ManagerRequest::GeneratorDone).is_err() {
            debug!("GeneratorLink::finish: manager already gone");
        }
        let mut leftover = Vec::new();
        while let Some(reply) = self.rx.blocking_recv() {
            leftover.push(reply);
        }
        leftover
    }
}

/// Cloneable control handle for the Manager
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerRequest>,
}

impl ManagerHandle {
    pub(crate) fn new(tx: mpsc::Sender<ManagerRequest>) -> Self {
        debug!("ManagerHandle::new: called");
        Self { tx }
    }

    /// Request a stop; the generator sees it as a `STOP` tag
    pub async fn stop(&self, reason: &str) -> CoordResult<()> {
        debug!(%reason, "ManagerHandle::stop: called");
        self.tx
            .send(ManagerRequest::Stop {
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| CoordError::Channel("manager request channel closed".to_string()))
    }

    /// Snapshot of the run counters
    pub async fn metrics(&self) -> CoordResult<ManagerMetrics> {
        debug!("ManagerHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| CoordError::Channel("manager request channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CoordError::Channel("manager dropped metrics request".to_string()))
    }
}
