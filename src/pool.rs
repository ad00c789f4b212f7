//! Bounded per-module instance pools.
//!
//! ```text
//!   checkout ──> try_recv ──hit──────────────────────────────> instance
//!                  │miss
//!                  ├─ live < capacity ──> instantiate (warm-up) ──> instance
//!                  └─ recv_timeout ──hit─────────────────────────> instance
//!                        │timeout
//!                        ├─ live < max_live ──> instantiate (ad hoc)
//!                        └─ PoolExhausted
//!
//!   release ──> try_send (never blocks); full, closed or poisoned ──> drop
//! ```
//!
//! An instance that trapped is discarded rather than returned, since its
//! linear memory and globals may have been left half-updated.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, trace};

use crate::descriptor::ModuleKey;
use crate::error::ExecError;
use crate::tier::{InstanceFactory, RawResults, Tier, TierInstance};
use crate::value::WasmValue;

type BoxedInstance = Box<dyn TierInstance>;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub live: usize,
    pub checkouts: u64,
    pub instantiations: u64,
    pub discarded: u64,
    pub exhausted: u64,
}

/// Ready-to-call instances of one module on one tier.
pub struct InstancePool {
    key: ModuleKey,
    factory: Arc<dyn InstanceFactory>,
    idle_tx: Sender<BoxedInstance>,
    idle_rx: Receiver<BoxedInstance>,
    capacity: usize,
    max_live: usize,
    checkout_timeout: Duration,
    /// Idle plus checked-out instances.
    live: AtomicUsize,
    closed: AtomicBool,

    checkouts: AtomicU64,
    instantiations: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
}

impl InstancePool {
    pub fn new(
        key: ModuleKey,
        factory: Arc<dyn InstanceFactory>,
        capacity: usize,
        max_live: usize,
        checkout_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = bounded(capacity);
        Self {
            key,
            factory,
            idle_tx,
            idle_rx,
            capacity,
            max_live: max_live.max(capacity),
            checkout_timeout,
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            checkouts: AtomicU64::new(0),
            instantiations: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.factory.tier()
    }

    /// Instantiate up to `n` idle instances ahead of traffic.
    pub fn prefill(&self, n: usize) -> Result<(), ExecError> {
        for _ in 0..n.min(self.capacity) {
            if !self.reserve(self.capacity) {
                break;
            }
            let instance = self.instantiate_reserved()?;
            if let Err(e) = self.idle_tx.try_send(instance) {
                drop(e.into_inner());
                self.live.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
        Ok(())
    }

    /// Take an instance for the duration of one call.
    pub fn checkout(&self) -> Result<PooledInstance<'_>, ExecError> {
        self.checkouts.fetch_add(1, Ordering::Relaxed);

        if let Ok(instance) = self.idle_rx.try_recv() {
            return Ok(self.lease(instance));
        }
        if self.reserve(self.capacity) {
            return self.instantiate_reserved().map(|i| self.lease(i));
        }

        trace!(target: "quidditch_udf::pool", module = %self.key, tier = %self.tier(), "Waiting for idle instance");
        match self.idle_rx.recv_timeout(self.checkout_timeout) {
            Ok(instance) => Ok(self.lease(instance)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                if self.reserve(self.max_live) {
                    debug!(target: "quidditch_udf::pool", module = %self.key, tier = %self.tier(), "Pool empty, instantiating ad hoc");
                    return self.instantiate_reserved().map(|i| self.lease(i));
                }
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(ExecError::PoolExhausted {
                    key: self.key.clone(),
                    timeout: self.checkout_timeout,
                })
            }
        }
    }

    /// Stop recycling instances and drop the idle ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while let Ok(instance) = self.idle_rx.try_recv() {
            drop(instance);
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            idle: self.idle_rx.len(),
            live: self.live.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            instantiations: self.instantiations.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Claim a live slot if fewer than `limit` instances exist.
    fn reserve(&self, limit: usize) -> bool {
        if self.is_closed() {
            return false;
        }
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |live| {
                (live < limit).then_some(live + 1)
            })
            .is_ok()
    }

    fn instantiate_reserved(&self) -> Result<BoxedInstance, ExecError> {
        match self.factory.instantiate() {
            Ok(instance) => {
                self.instantiations.fetch_add(1, Ordering::Relaxed);
                Ok(instance)
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn lease(&self, instance: BoxedInstance) -> PooledInstance<'_> {
        PooledInstance {
            pool: self,
            instance: Some(instance),
            poisoned: false,
        }
    }

    fn release(&self, instance: BoxedInstance, poisoned: bool) {
        if poisoned || self.is_closed() {
            self.discard(instance);
            return;
        }
        match self.idle_tx.try_send(instance) {
            Ok(()) => {}
            Err(TrySendError::Full(instance)) | Err(TrySendError::Disconnected(instance)) => {
                self.discard(instance)
            }
        }
    }

    fn discard(&self, instance: BoxedInstance) {
        drop(instance);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An instance on loan; goes back to its pool on drop.
pub struct PooledInstance<'a> {
    pool: &'a InstancePool,
    instance: Option<BoxedInstance>,
    poisoned: bool,
}

impl PooledInstance<'_> {
    #[inline]
    pub fn tier(&self) -> Tier {
        self.pool.tier()
    }

    /// Call the entry point. A trap poisons the instance so it is not reused.
    pub fn call(&mut self, args: &[WasmValue]) -> Result<RawResults, ExecError> {
        let Some(instance) = self.instance.as_mut() else {
            return Err(ExecError::Instantiation("instance already released".into()));
        };
        let result = instance.call(args);
        if matches!(result, Err(ExecError::Trap { .. })) {
            self.poisoned = true;
        }
        result
    }
}

impl Drop for PooledInstance<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance, self.poisoned);
        }
    }
}
