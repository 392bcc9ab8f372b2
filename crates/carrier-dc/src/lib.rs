//! Discharge client (spec §2 `dc`, §6 `DischargeClient`).
//!
//! Fetches the third-party caveat discharges a Blessing requires before it
//! can be presented, and caches them under the caveat's fingerprint until
//! they expire. The actual discharge-issuing policy is an external
//! collaborator (spec §1 "discharge/caveat policy engine" is out of
//! scope); this crate owns only the cache and the retry-free
//! fetch-once-per-fingerprint discipline.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A third-party caveat naming the fingerprint of the discharge it needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caveat {
    pub fingerprint: String,
}

/// Context passed to the discharge-issuing service explaining why the
/// discharge is being requested (spec §6 `impetus`).
#[derive(Debug, Clone, Default)]
pub struct Impetus {
    pub method: String,
    pub suffix: String,
}

/// A discharge credential, opaque beyond its fingerprint and expiry.
#[derive(Debug, Clone)]
pub struct Discharge {
    pub fingerprint: String,
    pub bytes: Vec<u8>,
    pub expires_at: Option<Instant>,
}

impl Discharge {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("discharge fetch failed for {fingerprint}: {message}")]
pub struct DcError {
    pub fingerprint: String,
    pub message: String,
}

/// External collaborator that actually talks to the third-party discharge
/// service (spec §1: out of scope, interface only).
pub trait DischargeFetcher: Send + Sync + 'static {
    fn fetch(&self, caveat: &Caveat, impetus: &Impetus) -> Result<Discharge, DcError>;
}

struct Inner {
    fetcher: Arc<dyn DischargeFetcher>,
    cache: Mutex<HashMap<String, Discharge>>,
}

/// Caches discharges under their fingerprint; invalidates on expiry (spec
/// §2 `dc`: "caches them under a fingerprint; invalidates on expiry").
#[derive(Clone)]
pub struct DischargeClient {
    inner: Arc<Inner>,
}

impl DischargeClient {
    pub fn new(fetcher: Arc<dyn DischargeFetcher>) -> Self {
        DischargeClient {
            inner: Arc::new(Inner {
                fetcher,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns one discharge per caveat, fetching (and caching) any whose
    /// cached copy is missing or expired. The first caveat to fail aborts
    /// the whole batch — a call can't partially succeed on discharges.
    pub fn prepare_discharges(
        &self,
        caveats: &[Caveat],
        impetus: &Impetus,
    ) -> Result<Vec<Discharge>, DcError> {
        let mut out = Vec::with_capacity(caveats.len());
        for caveat in caveats {
            out.push(self.discharge_for(caveat, impetus)?);
        }
        Ok(out)
    }

    fn discharge_for(&self, caveat: &Caveat, impetus: &Impetus) -> Result<Discharge, DcError> {
        if let Some(cached) = self.inner.cache.lock().get(&caveat.fingerprint) {
            if !cached.is_expired() {
                return Ok(cached.clone());
            }
        }
        let fresh = self.inner.fetcher.fetch(caveat, impetus)?;
        self.inner
            .cache
            .lock()
            .insert(caveat.fingerprint.clone(), fresh.clone());
        Ok(fresh)
    }

    /// Drops every cached discharge that has expired.
    pub fn evict_expired(&self) {
        self.inner.cache.lock().retain(|_, d| !d.is_expired());
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cache.lock().len()
    }
}
