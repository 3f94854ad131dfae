//! In-process cancellation signals for running jobs.
//!
//! The durable half of a cancellation is the `cancel_requested` flag in the
//! job store. This registry is the fast half: it lets the gateway interrupt
//! the supervisor that is running the job right now.

use std::collections::HashMap;
use std::sync::Mutex;

use audionorm_core::types::DbId;
use tokio_util::sync::CancellationToken;

/// Maps running job ids to the token their supervisor is watching.
///
/// Entries exist only while an executor runs the job. A cancellation that
/// finds no entry is carried by the store flag alone.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<DbId, Registration>>,
}

#[derive(Debug)]
struct Registration {
    attempt: i32,
    token: CancellationToken,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `attempt` of a job an executor has just leased.
    ///
    /// The token is a child of `shutdown`.
    pub fn register(&self, job_id: DbId, attempt: i32, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        self.lock().insert(
            job_id,
            Registration {
                attempt,
                token: token.clone(),
            },
        );
        token
    }

    /// Signal the executor running `job_id`.
    ///
    /// Returns `true` if an executor had registered the job.
    pub fn cancel(&self, job_id: DbId) -> bool {
        match self.lock().get(&job_id) {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a job once the executor of `attempt` is done with it.
    ///
    /// A later attempt's registration is left alone.
    pub fn remove(&self, job_id: DbId, attempt: i32) {
        let mut tokens = self.lock();
        if tokens.get(&job_id).is_some_and(|r| r.attempt == attempt) {
            tokens.remove(&job_id);
        }
    }

    /// Number of jobs currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DbId, Registration>> {
        // A poisoned map is still a valid map.
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signals_registered_token() {
        let registry = CancellationRegistry::new();
        let shutdown = CancellationToken::new();
        let token = registry.register(1, 0, &shutdown);

        assert!(registry.cancel(1));
        assert!(token.is_cancelled());
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn cancel_of_unregistered_job_leaves_no_entry() {
        let registry = CancellationRegistry::new();
        for job_id in 1..=5 {
            assert!(!registry.cancel(job_id));
        }
        assert!(registry.is_empty());

        let token = registry.register(2, 0, &CancellationToken::new());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn shutdown_cancels_every_job_token() {
        let registry = CancellationRegistry::new();
        let shutdown = CancellationToken::new();
        let a = registry.register(1, 0, &shutdown);
        let b = registry.register(2, 0, &shutdown);

        shutdown.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn remove_forgets_job() {
        let registry = CancellationRegistry::new();
        registry.register(3, 0, &CancellationToken::new());
        assert_eq!(registry.len(), 1);

        registry.remove(3, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_attempt_does_not_remove_newer_registration() {
        let registry = CancellationRegistry::new();
        let shutdown = CancellationToken::new();
        registry.register(4, 0, &shutdown);
        let current = registry.register(4, 1, &shutdown);

        registry.remove(4, 0);
        assert_eq!(registry.len(), 1);
        assert!(registry.cancel(4));
        assert!(current.is_cancelled());
    }
}
