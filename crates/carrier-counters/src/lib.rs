//! Flow-control accounting (spec §2 `counters`, §4.3).
//!
//! A mapping from `(VC-ID, Flow-ID)` to remaining send/receive credits, with
//! atomic add/subtract so the VIF's readLoop (crediting) and a Flow's
//! writer (debiting) never need to share a lock across a blocking
//! operation.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

pub type Vci = u32;
pub type FlowId = u32;

/// A table of per-(VC, Flow) credit counters. Cheap to clone: it's a
/// reference-counted handle onto shared atomics.
#[derive(Clone, Default)]
pub struct CounterTable {
    entries: Arc<Mutex<HashMap<(Vci, FlowId), Arc<AtomicI64>>>>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, vci: Vci, flow_id: FlowId) -> Arc<AtomicI64> {
        let mut entries = self.entries.lock();
        entries
            .entry((vci, flow_id))
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    /// Sets the initial credit for a (VC, Flow) pair, overwriting any prior
    /// value (used when a Flow is first created).
    pub fn set(&self, vci: Vci, flow_id: FlowId, credit: i64) {
        self.entry(vci, flow_id).store(credit, Ordering::SeqCst);
    }

    /// Atomically adds `delta` (may be negative) and returns the new total.
    pub fn add(&self, vci: Vci, flow_id: FlowId, delta: i64) -> i64 {
        self.entry(vci, flow_id)
            .fetch_add(delta, Ordering::SeqCst)
            + delta
    }

    /// Attempts to atomically reserve `amount` of credit (subtracting it
    /// only if enough is available). Returns whether the reservation
    /// succeeded.
    pub fn try_reserve(&self, vci: Vci, flow_id: FlowId, amount: i64) -> bool {
        let counter = self.entry(vci, flow_id);
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current < amount {
                return false;
            }
            match counter.compare_exchange_weak(
                current,
                current - amount,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self, vci: Vci, flow_id: FlowId) -> i64 {
        self.entries
            .lock()
            .get(&(vci, flow_id))
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Removes every counter belonging to `vci` (VC teardown, spec §3
    /// invariant: closing a VC tears down every Flow on it).
    pub fn remove_vc(&self, vci: Vci) {
        self.entries.lock().retain(|&(v, _), _| v != vci);
    }

    pub fn remove_flow(&self, vci: Vci, flow_id: FlowId) {
        self.entries.lock().remove(&(vci, flow_id));
    }
}
