//! Environment probes consulted by the scheduler.
//!
//! Two questions are asked of the host: is there a live client context at
//! all (if not, `enqueue` is a no-op), and is the network reachable right now
//! (if not, a flush re-arms instead of draining).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A boolean question about the host environment.
pub trait Probe: Send + Sync + 'static {
    fn check(&self) -> bool;
}

impl<F> Probe for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn check(&self) -> bool {
        self()
    }
}

/// Shared switch usable as a probe; clones observe the same value.
#[derive(Clone)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Flag").field(&self.get()).finish()
    }
}

impl Probe for Flag {
    fn check(&self) -> bool {
        self.get()
    }
}

/// Probe that always answers `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl Probe for Always {
    fn check(&self) -> bool {
        true
    }
}
