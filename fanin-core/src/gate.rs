use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// External switch consulted before every tick. While suspended a worker neither fetches nor
/// emits, even if records are buffered.
pub trait PollGate: Send + Sync {
    fn is_suspended(&self) -> bool;
}

impl<F> PollGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_suspended(&self) -> bool {
        self()
    }
}

/// A [PollGate] flipped by hand. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct SuspendSwitch {
    suspended: Arc<AtomicBool>,
}

impl SuspendSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
    }
}

impl PollGate for SuspendSwitch {
    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }
}
