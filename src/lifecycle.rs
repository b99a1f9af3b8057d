//! The host-platform bridge the core requires but does not implement
//! itself. Absent a host, these hooks are simply never invoked.

/// Subscription interface a host passes at construction to receive cache
/// lifecycle events. A no-op by default on every method.
pub trait LifecycleObserver: Send + Sync {
    /// Called after the cache has reacted to a memory-pressure signal
    /// (and, per config, already cleared itself).
    fn on_memory_warning(&self) {}

    /// Called after the cache has reacted to the host entering the
    /// background (and, per config, already cleared itself).
    fn on_background(&self) {}
}

/// The default observer: does nothing.
#[derive(Default, Clone, Copy)]
pub struct NullObserver;

impl LifecycleObserver for NullObserver {}
