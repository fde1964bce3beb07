pub mod install;
pub mod preferences;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub use session::{check_versions, instrumentation_extras, Device, DeviceParts, CLIENT_VERSION};

/// Run-wide abort flag shared by every session of one test run. Once raised, sessions
/// refuse to start servers or dispatch actions.
#[derive(Debug, Clone, Default)]
pub struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Calls `probe` up to `attempts` times, sleeping `interval` between tries. Returns the
/// 1-based attempt that succeeded.
pub(crate) fn poll_until<F>(attempts: u32, interval: Duration, mut probe: F) -> Option<u32>
where
    F: FnMut(u32) -> bool,
{
    for attempt in 1..=attempts {
        if probe(attempt) {
            return Some(attempt);
        }
        if attempt < attempts && !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    None
}

#[cfg(test)]
mod tests;
