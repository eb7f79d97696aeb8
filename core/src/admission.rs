//! Concurrency gate in front of the executor.
//!
//! Waiting for a slot is backpressure, not an error: a blocked request only fails when its
//! cancellation token fires or the controller is shut down.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StoreError;

pub const DEFAULT_MAX_CONCURRENT_TXN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    AllowAll,
    LimitConcurrentTransactions { max_concurrent: usize, only_writes: bool },
}

impl Default for AdmissionPolicy {
    fn default() -> Self { AdmissionPolicy::AllowAll }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Read,
    Write,
}

/// Held for the duration of one transaction; dropping it frees the slot.
#[derive(Debug)]
pub struct Admission(#[allow(dead_code)] Option<OwnedSemaphorePermit>);

#[derive(Debug)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
    slots: Option<Arc<Semaphore>>,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        let slots = match policy {
            AdmissionPolicy::AllowAll => None,
            AdmissionPolicy::LimitConcurrentTransactions { max_concurrent, .. } => Some(Arc::new(Semaphore::new(max_concurrent.max(1)))),
        };
        Self { policy, slots }
    }

    pub fn policy(&self) -> AdmissionPolicy { self.policy }

    fn gates(&self, kind: TxnKind) -> bool {
        match self.policy {
            AdmissionPolicy::AllowAll => false,
            AdmissionPolicy::LimitConcurrentTransactions { only_writes, .. } => !only_writes || kind == TxnKind::Write,
        }
    }

    /// Waits for a slot, if this kind of transaction is gated.
    pub async fn admit(&self, ctx: &CancellationToken, kind: TxnKind) -> Result<Admission, StoreError> {
        let slots = match &self.slots {
            Some(slots) if self.gates(kind) => slots.clone(),
            _ => return Ok(Admission(None)),
        };

        if let Ok(permit) = slots.clone().try_acquire_owned() {
            return Ok(Admission(Some(permit)));
        }

        debug!("admission: {kind:?} transaction waiting for a slot");
        tokio::select! {
            _ = ctx.cancelled() => Err(StoreError::Cancelled),
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => Ok(Admission(Some(permit))),
                // closed by shutdown
                Err(_) => Err(StoreError::Cancelled),
            },
        }
    }

    /// Slots currently free, or `None` when nothing is gated.
    pub fn available(&self) -> Option<usize> { self.slots.as_ref().map(|slots| slots.available_permits()) }

    /// Fails every waiting and future gated request.
    pub fn close(&self) {
        if let Some(slots) = &self.slots {
            slots.close();
        }
    }
}
