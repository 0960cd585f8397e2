//! Open backend connection counting and RAII guard.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide count of backend connections whose actor is running.
static OPEN_BACKENDS: AtomicU64 = AtomicU64::new(0);

/// Guard counting one running backend actor for `service`.
pub(super) struct OpenBackend {
    service: String,
}

impl OpenBackend {
    pub(super) fn new(service: &str) -> Self {
        OPEN_BACKENDS.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_backends(service);
        Self {
            service: service.to_owned(),
        }
    }
}

impl Drop for OpenBackend {
    fn drop(&mut self) {
        OPEN_BACKENDS.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_backends(&self.service);
    }
}

/// Return the current number of running backend actors.
#[must_use]
pub fn open_backend_count() -> u64 { OPEN_BACKENDS.load(Ordering::Relaxed) }
