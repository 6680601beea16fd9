//! Invite code allocation and the pending-offer registry.
//!
//! The broker is the only shared mutable state in the transfer path. Every
//! operation takes one short-lived lock with no I/O inside the critical
//! section, so unrelated transfers never serialize on each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::BrokerError;

/// Allocatable code range; the code doubles as the loopback transfer port,
/// so it stays out of the privileged range.
pub const CODE_MIN: u16 = 1024;
pub const CODE_MAX: u16 = 65535;

/// Random draws per registration before giving up
const MAX_ALLOC_ATTEMPTS: u32 = 64;

/// One registered artifact waiting for its single retrieval.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub code: u16,
    pub artifact_path: PathBuf,
    pub created_at: SystemTime,
}

struct Inner {
    offers: HashMap<u16, PendingOffer>,
    rng: StdRng,
}

/// Allocates short numeric invite codes and maps them to artifact paths.
///
/// Owned by the service and passed around explicitly; randomness and clock
/// are injectable so allocation is deterministic under test.
pub struct CodeBroker {
    inner: Mutex<Inner>,
    now: fn() -> SystemTime,
}

impl Default for CodeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBroker {
    pub fn new() -> Self {
        Self::with_rng_and_clock(StdRng::from_os_rng(), SystemTime::now)
    }

    pub fn with_rng_and_clock(rng: StdRng, now: fn() -> SystemTime) -> Self {
        Self {
            inner: Mutex::new(Inner {
                offers: HashMap::new(),
                rng,
            }),
            now,
        }
    }

    /// Allocate a fresh code for `artifact_path`.
    ///
    /// Draws from [`CODE_MIN`]..=[`CODE_MAX`] and retries on collision a
    /// bounded number of times; two concurrent registrations can never end
    /// up with the same code.
    pub fn register(&self, artifact_path: &Path) -> Result<u16, BrokerError> {
        // Logging stays outside the critical section
        let allocated = {
            let mut inner = self.lock();
            let mut allocated = None;
            for _ in 0..MAX_ALLOC_ATTEMPTS {
                let code = inner.rng.random_range(CODE_MIN..=CODE_MAX);
                if inner.offers.contains_key(&code) {
                    continue;
                }
                inner.offers.insert(
                    code,
                    PendingOffer {
                        code,
                        artifact_path: artifact_path.to_path_buf(),
                        created_at: (self.now)(),
                    },
                );
                allocated = Some(code);
                break;
            }
            allocated
        };

        match allocated {
            Some(code) => {
                tracing::info!(code, artifact = %artifact_path.display(), "registered artifact");
                Ok(code)
            }
            None => Err(BrokerError::PortExhausted {
                attempts: MAX_ALLOC_ATTEMPTS,
            }),
        }
    }

    /// Path registered for `code`, if the offer is still live.
    pub fn lookup(&self, code: u16) -> Option<PathBuf> {
        self.lock().offers.get(&code).map(|o| o.artifact_path.clone())
    }

    /// Drop the offer for `code`. Revoking an absent code is a no-op.
    pub fn revoke(&self, code: u16) {
        let removed = self.lock().offers.remove(&code).is_some();
        if removed {
            tracing::info!(code, "revoked invite code");
        }
    }

    /// Number of currently live offers
    pub fn live_offers(&self) -> usize {
        self.lock().offers.len()
    }

    /// Occupy every allocatable code so the next `register` must fail.
    #[cfg(test)]
    pub(crate) fn occupy_all_codes(&self) {
        let mut inner = self.lock();
        for code in CODE_MIN..=CODE_MAX {
            inner.offers.insert(
                code,
                PendingOffer {
                    code,
                    artifact_path: PathBuf::from("occupied"),
                    created_at: (self.now)(),
                },
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-mutation of
        // a HashMap insert/remove; the map itself is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
