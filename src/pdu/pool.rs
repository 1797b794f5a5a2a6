//! Bounded pool of PDU buffers.
//!
//! The pool hands out slots rather than memory: a [`Pdu`](super::Pdu)
//! holding a [`PoolSlot`] counts against the pool until it is dropped. When
//! every slot is in use, [`PduPool::acquire`] waits instead of failing, so
//! the receive path applies back-pressure to the transport rather than
//! discarding data.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Returned once the pool has been closed during session teardown.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("pdu pool closed")]
pub struct PoolClosed;

/// A reserved pool entry; released on drop.
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

/// Fixed-capacity pool shared by both engines of a session.
#[derive(Debug)]
pub struct PduPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl PduPool {
    /// Create a pool with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Reserve a slot, waiting for one to be released if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] if the pool is closed while waiting.
    pub async fn acquire(&self) -> Result<PoolSlot, PoolClosed> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;
        Ok(PoolSlot { _permit: permit })
    }

    /// Reserve a slot without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Ok(None)` when the pool is exhausted and [`PoolClosed`] once
    /// it has been closed.
    pub fn try_acquire(&self) -> Result<Option<PoolSlot>, PoolClosed> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(Some(PoolSlot { _permit: permit })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolClosed),
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize { self.capacity }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize { self.permits.available_permits() }

    /// Slots currently held by live PDUs.
    #[must_use]
    pub fn in_use(&self) -> usize { self.capacity.saturating_sub(self.available()) }

    /// Wake every waiter with [`PoolClosed`] and refuse new reservations.
    pub fn close(&self) { self.permits.close(); }
}
