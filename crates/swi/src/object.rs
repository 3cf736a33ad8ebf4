//! Schedulable-object types and construction parameters.

use core::fmt;
use core::mem;

use crate::sync::Arc;

/// Callback invoked each time a software interrupt runs.
///
/// The two `usize` arguments are opaque values fixed at construction and
/// passed unchanged to every invocation. Handlers must not block; they run
/// to completion inside the pump interrupt.
pub type SwiHandler = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Handle to a constructed software interrupt.
///
/// Handles are only produced by the scheduler and index its object table;
/// a handle to a destructed object is reported as not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwiId(u16);

impl SwiId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u16)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SwiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Swi({})", self.0)
    }
}

/// Scheduling state of one software interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwiState {
    /// Not scheduled.
    Idle,
    /// Enqueued on a ready list, waiting to run.
    Posted,
    /// Callback currently executing.
    Running,
}

impl fmt::Display for SwiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwiState::Idle => write!(f, "Idle"),
            SwiState::Posted => write!(f, "Posted"),
            SwiState::Running => write!(f, "Running"),
        }
    }
}

/// Construction parameters for a software interrupt.
///
/// `priority == None` selects the default level, `NUM_PRI - 1`. `trigger`
/// is both the initial trigger value and the value the object is re-armed
/// with after each run.
#[derive(Debug, Clone)]
pub struct SwiParams {
    pub priority: Option<u8>,
    pub trigger: u32,
    pub arg0: usize,
    pub arg1: usize,
    pub name: Option<&'static str>,
}

impl Default for SwiParams {
    fn default() -> Self {
        Self {
            priority: None,
            trigger: 0,
            arg0: 0,
            arg1: 0,
            name: None,
        }
    }
}

impl SwiParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit priority level in `0..NUM_PRI`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the initial and re-arm trigger value.
    pub fn with_trigger(mut self, trigger: u32) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the two opaque arguments handed to the callback.
    pub fn with_args(mut self, arg0: usize, arg1: usize) -> Self {
        self.arg0 = arg0;
        self.arg1 = arg1;
        self
    }

    /// Attaches a name carried into trace records.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }
}

/// Backing storage for one constructed software interrupt.
pub(crate) struct SwiSlot {
    pub handler: SwiHandler,
    pub priority: u8,
    pub arg0: usize,
    pub arg1: usize,
    /// Value `trigger` is reset to before each run.
    pub arm_trigger: u32,
    /// Live counter/bitmask mutated by the arming operations.
    pub trigger: u32,
    pub state: SwiState,
    pub name: Option<&'static str>,
}

/// Bytes of scheduler-internal storage one object occupies, for callers
/// that reserve storage statically.
pub fn required_storage_size() -> usize {
    mem::size_of::<SwiSlot>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_to_sentinel_priority() {
        let params = SwiParams::default();
        assert_eq!(params.priority, None);
        assert_eq!(params.trigger, 0);
        assert_eq!((params.arg0, params.arg1), (0, 0));
        assert_eq!(params.name, None);
    }

    #[test]
    fn params_builder_chains() {
        let params = SwiParams::new()
            .with_priority(2)
            .with_trigger(3)
            .with_args(10, 20)
            .with_name("uart-rx");
        assert_eq!(params.priority, Some(2));
        assert_eq!(params.trigger, 3);
        assert_eq!((params.arg0, params.arg1), (10, 20));
        assert_eq!(params.name, Some("uart-rx"));
    }

    #[test]
    fn storage_size_is_nonzero() {
        assert!(required_storage_size() > 0);
    }

    #[test]
    fn id_formats_with_index() {
        assert_eq!(SwiId::from_index(7).to_string(), "Swi(7)");
    }
}
