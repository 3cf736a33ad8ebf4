//! Hardware-interrupt port abstraction and the host implementation.
//!
//! The scheduler owns exactly one hardware interrupt, the *pump*, reserved
//! at the lowest hardware priority: it never preempts true ISRs, only
//! task-level code. The port is how the scheduler asks the platform to
//! deliver that interrupt.

use std::cell::Cell;

use crate::sync::{Arc, Mutex};

/// Handler installed for the pump interrupt.
pub type PumpHandler = Arc<dyn Fn() + Send + Sync>;

/// Hardware priority level reserved for the pump interrupt (lowest).
pub const PUMP_PRIORITY: u8 = u8::MAX;

/// Platform interface for the pump interrupt.
pub trait InterruptPort: Send + Sync {
    /// Installs the handler for the reserved pump interrupt at the given
    /// hardware priority. Called once during scheduler construction.
    fn register(&self, priority: u8, handler: PumpHandler);

    /// Requests delivery of the pump interrupt. Requests are coalesced:
    /// multiple raises before the handler runs are equivalent to one.
    fn raise(&self);

    /// Whether the calling context is executing inside the pump interrupt.
    fn in_interrupt(&self) -> bool;
}

thread_local! {
    static INT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Host port: delivers the pump interrupt synchronously.
///
/// `raise` invokes the registered handler inline, which models an interrupt
/// that fires the moment interrupts are re-enabled. The scheduler only
/// raises after releasing its state lock, so the inline call never
/// re-enters a held critical section.
pub struct HostPort {
    handler: Mutex<Option<PumpHandler>>,
}

impl HostPort {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptPort for HostPort {
    fn register(&self, priority: u8, handler: PumpHandler) {
        log::debug!("pump handler registered at hardware priority {priority}");
        *self.handler.lock() = Some(handler);
    }

    fn raise(&self) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            INT_DEPTH.with(|depth| depth.set(depth.get() + 1));
            handler();
            INT_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }

    fn in_interrupt(&self) -> bool {
        INT_DEPTH.with(|depth| depth.get()) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn raise_without_handler_is_a_noop() {
        let port = HostPort::new();
        port.raise();
        assert!(!port.in_interrupt());
    }

    #[test]
    fn raise_invokes_registered_handler() {
        let port = HostPort::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        port.register(PUMP_PRIORITY, Arc::new(move || {
            probe.fetch_add(1, Ordering::SeqCst);
        }));

        port.raise();
        port.raise();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn in_interrupt_is_true_only_inside_the_handler() {
        let port = Arc::new(HostPort::new());
        let observed = Arc::new(AtomicUsize::new(0));

        let inner_port = Arc::clone(&port);
        let probe = Arc::clone(&observed);
        port.register(PUMP_PRIORITY, Arc::new(move || {
            if inner_port.in_interrupt() {
                probe.fetch_add(1, Ordering::SeqCst);
            }
        }));

        assert!(!port.in_interrupt());
        port.raise();
        assert!(!port.in_interrupt());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
