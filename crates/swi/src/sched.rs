//! Scheduler context: object registry, trigger/arming protocol, scheduling
//! gate, and the run-to-completion dispatch loop.
//!
//! All shared mutable state lives in one [`SchedState`] behind a single
//! mutex, this port's stand-in for an interrupts-disabled critical section.
//! The dispatch loop releases the lock only around callback invocation;
//! every other read-modify-write holds it.

use once_cell::sync::Lazy;
use thiserror::Error;

use rtlog::{records, TraceHook};

use crate::object::{SwiHandler, SwiId, SwiParams, SwiSlot, SwiState};
use crate::port::{HostPort, InterruptPort, PUMP_PRIORITY};
use crate::ready::{ReadyQueues, NUM_PRI};
use crate::sync::{Arc, Mutex};

/// Default object-table capacity.
pub const DEFAULT_CAPACITY: usize = 32;

/// Errors reported by scheduler operations.
#[derive(Debug, Error)]
pub enum SwiError {
    /// Priority outside `0..NUM_PRI` and not the default sentinel.
    #[error("priority {0} outside supported range")]
    InvalidPriority(u8),
    /// Handle does not name a live object.
    #[error("software interrupt {0} not found")]
    NotFound(SwiId),
    /// Object table exhausted; nothing was created.
    #[error("object table full ({0} objects)")]
    TableFull(usize),
}

/// State of the global scheduling gate.
///
/// The gate is a single-level flag, not a counting lock: [`SwiScheduler::disable`]
/// returns the previous value as a key and callers are responsible for
/// pairing each `disable` with a `restore` of that key, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Unlocked,
    Locked,
}

impl Gate {
    pub fn is_locked(self) -> bool {
        matches!(self, Gate::Locked)
    }
}

struct SchedState {
    slots: Vec<Option<SwiSlot>>,
    ready: ReadyQueues,
    gate: Gate,
    pump_armed: bool,
    last_trigger: u32,
}

impl SchedState {
    fn slot(&self, id: SwiId) -> Result<&SwiSlot, SwiError> {
        self.slots
            .get(id.index())
            .and_then(|entry| entry.as_ref())
            .ok_or(SwiError::NotFound(id))
    }

    fn slot_mut(&mut self, id: SwiId) -> Result<&mut SwiSlot, SwiError> {
        self.slots
            .get_mut(id.index())
            .and_then(|entry| entry.as_mut())
            .ok_or(SwiError::NotFound(id))
    }
}

/// Outcome of a `post` that actually queued the object.
struct PostAction {
    priority: u8,
    raise_pump: bool,
}

pub struct SchedulerBuilder {
    capacity: usize,
    trace: Option<TraceHook>,
    port: Option<Arc<dyn InterruptPort>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            trace: None,
            port: None,
        }
    }

    /// Caps the number of simultaneously constructed objects.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    /// Substitutes the interrupt port; defaults to [`HostPort`].
    pub fn with_port(mut self, port: Arc<dyn InterruptPort>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn build(self) -> Arc<SwiScheduler> {
        let port = self
            .port
            .unwrap_or_else(|| Arc::new(HostPort::new()) as Arc<dyn InterruptPort>);
        let sched = Arc::new(SwiScheduler {
            state: Mutex::new(SchedState {
                slots: Vec::new(),
                ready: ReadyQueues::new(),
                gate: Gate::Unlocked,
                pump_armed: false,
                last_trigger: 0,
            }),
            capacity: self.capacity,
            trace: self.trace,
            port,
        });

        let pump = Arc::downgrade(&sched);
        sched.port.register(
            PUMP_PRIORITY,
            Arc::new(move || {
                if let Some(sched) = pump.upgrade() {
                    sched.dispatch();
                }
            }),
        );
        sched
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The software-interrupt scheduler.
///
/// One instance per process is the intended deployment (see [`scheduler`]);
/// explicit instances remain constructible for tests and embedders that
/// bring their own [`InterruptPort`].
pub struct SwiScheduler {
    state: Mutex<SchedState>,
    capacity: usize,
    trace: Option<TraceHook>,
    port: Arc<dyn InterruptPort>,
}

static SCHEDULER: Lazy<Arc<SwiScheduler>> = Lazy::new(|| SwiScheduler::builder().build());

/// Process-wide scheduler instance, initialized on first use over the host
/// port. Never torn down.
pub fn scheduler() -> &'static Arc<SwiScheduler> {
    &SCHEDULER
}

impl SwiScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    fn resolve_priority(priority: Option<u8>) -> Result<u8, SwiError> {
        match priority {
            None => Ok((NUM_PRI - 1) as u8),
            Some(p) if (p as usize) < NUM_PRI => Ok(p),
            Some(p) => Err(SwiError::InvalidPriority(p)),
        }
    }

    /// Constructs a software interrupt from caller-provided parameters.
    ///
    /// Validation is all-or-nothing: on error no object exists. The new
    /// object starts Idle with its trigger at the re-arm value.
    pub fn construct(
        &self,
        handler: SwiHandler,
        params: &SwiParams,
    ) -> Result<SwiId, SwiError> {
        let priority = Self::resolve_priority(params.priority)?;
        let mut state = self.state.lock();
        let index = match state.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if state.slots.len() < self.capacity => {
                state.slots.push(None);
                state.slots.len() - 1
            }
            None => return Err(SwiError::TableFull(self.capacity)),
        };
        state.slots[index] = Some(SwiSlot {
            handler,
            priority,
            arg0: params.arg0,
            arg1: params.arg1,
            arm_trigger: params.trigger,
            trigger: params.trigger,
            state: SwiState::Idle,
            name: params.name,
        });
        drop(state);

        let id = SwiId::from_index(index);
        log::debug!("constructed {id} at priority {priority}");
        self.emit_id_pri(records::swi::CONSTRUCT, id, priority);
        Ok(id)
    }

    /// Dynamic-creation entry point.
    ///
    /// Kept for parity with the placement-style [`construct`]; both install
    /// into the scheduler's object table, and exhaustion surfaces as
    /// [`SwiError::TableFull`] with no partial object left behind.
    ///
    /// [`construct`]: SwiScheduler::construct
    pub fn create(&self, handler: SwiHandler, params: &SwiParams) -> Result<SwiId, SwiError> {
        self.construct(handler, params)
    }

    /// Tears down an object, unlinking it from its ready list if Posted.
    pub fn destruct(&self, id: SwiId) -> Result<(), SwiError> {
        let mut state = self.state.lock();
        let entry = state.slots.get_mut(id.index()).ok_or(SwiError::NotFound(id))?;
        let slot = entry.take().ok_or(SwiError::NotFound(id))?;
        if slot.state == SwiState::Posted {
            state.ready.remove(id, slot.priority);
        }
        drop(state);

        log::debug!("destructed {id}");
        self.emit_id(records::swi::DESTRUCT, id);
        Ok(())
    }

    /// Deletes a dynamically created object; see [`destruct`].
    ///
    /// [`destruct`]: SwiScheduler::destruct
    pub fn delete(&self, id: SwiId) -> Result<(), SwiError> {
        self.destruct(id)
    }

    /// Re-targets which ready list future posts of `id` use.
    ///
    /// A currently-Posted object is relocated to the tail of the new
    /// level's queue in the same critical section, so the ready mask and
    /// the object's priority never disagree.
    pub fn set_priority(&self, id: SwiId, priority: Option<u8>) -> Result<(), SwiError> {
        let new_pri = Self::resolve_priority(priority)?;
        let mut state = self.state.lock();
        let (old_pri, posted) = {
            let slot = state.slot_mut(id)?;
            let old = slot.priority;
            slot.priority = new_pri;
            (old, slot.state == SwiState::Posted)
        };
        if posted && old_pri != new_pri {
            state.ready.remove(id, old_pri);
            state.ready.enqueue(id, new_pri);
        }
        Ok(())
    }

    /// Unconditionally arms `id`.
    ///
    /// Idempotent: an already-Posted object is left with its single
    /// ready-list entry. Arms the pump when the gate is open and no pump is
    /// already in flight.
    pub fn post(&self, id: SwiId) -> Result<(), SwiError> {
        let mut state = self.state.lock();
        let action = self.post_locked(&mut state, id)?;
        drop(state);
        self.finish_post(id, action);
        Ok(())
    }

    /// Adds one to the trigger and posts; every increment schedules a run.
    pub fn increment(&self, id: SwiId) -> Result<(), SwiError> {
        let mut state = self.state.lock();
        {
            let slot = state.slot_mut(id)?;
            slot.trigger = slot.trigger.wrapping_add(1);
        }
        let action = self.post_locked(&mut state, id)?;
        drop(state);
        self.finish_post(id, action);
        Ok(())
    }

    /// Counts the trigger down; posts only on the transition to zero.
    /// A decrement at zero is a no-op.
    pub fn decrement(&self, id: SwiId) -> Result<(), SwiError> {
        let mut state = self.state.lock();
        let armed = {
            let slot = state.slot_mut(id)?;
            if slot.trigger != 0 {
                slot.trigger -= 1;
                slot.trigger == 0
            } else {
                false
            }
        };
        let action = if armed {
            self.post_locked(&mut state, id)?
        } else {
            None
        };
        drop(state);
        self.finish_post(id, action);
        Ok(())
    }

    /// ORs `mask` into the trigger and posts.
    pub fn or_mask(&self, id: SwiId, mask: u32) -> Result<(), SwiError> {
        let mut state = self.state.lock();
        {
            let slot = state.slot_mut(id)?;
            slot.trigger |= mask;
        }
        let action = self.post_locked(&mut state, id)?;
        drop(state);
        self.finish_post(id, action);
        Ok(())
    }

    /// Clears `mask` bits from the trigger; posts only on the transition to
    /// zero. A clear at zero is a no-op.
    pub fn and_not_mask(&self, id: SwiId, mask: u32) -> Result<(), SwiError> {
        let mut state = self.state.lock();
        let armed = {
            let slot = state.slot_mut(id)?;
            if slot.trigger != 0 {
                slot.trigger &= !mask;
                slot.trigger == 0
            } else {
                false
            }
        };
        let action = if armed {
            self.post_locked(&mut state, id)?
        } else {
            None
        };
        drop(state);
        self.finish_post(id, action);
        Ok(())
    }

    /// Closes the scheduling gate, returning the previous state as the key
    /// for [`restore`]. Posted work accumulates while the gate is closed.
    ///
    /// [`restore`]: SwiScheduler::restore
    #[must_use = "pass the returned key back to restore"]
    pub fn disable(&self) -> Gate {
        let mut state = self.state.lock();
        let key = state.gate;
        state.gate = Gate::Locked;
        drop(state);

        if key == Gate::Unlocked {
            log::trace!("scheduling gate locked");
            self.emit(records::swi::GATE_LOCK, &[]);
        }
        key
    }

    /// Writes a key from [`disable`] back to the gate. Opening the gate
    /// with ready work pending and no pump in flight arms the pump exactly
    /// once.
    ///
    /// [`disable`]: SwiScheduler::disable
    pub fn restore(&self, key: Gate) {
        let mut state = self.state.lock();
        let was_locked = state.gate.is_locked();
        state.gate = key;
        let raise = key == Gate::Unlocked && !state.ready.is_empty() && !state.pump_armed;
        if raise {
            state.pump_armed = true;
        }
        drop(state);

        if was_locked && key == Gate::Unlocked {
            log::trace!("scheduling gate unlocked");
            self.emit(records::swi::GATE_UNLOCK, &[]);
        }
        if raise {
            self.emit(records::swi::PUMP_ARM, &[]);
            self.port.raise();
        }
    }

    /// Runs queued objects until none remain or the gate closes.
    ///
    /// Entered from the pump interrupt. Each iteration re-selects the most
    /// urgent ready object, snapshots and re-arms its trigger, then runs
    /// the callback with the state lock released so posting from other
    /// contexts (including the callback itself) stays possible.
    pub fn dispatch(&self) {
        let mut state = self.state.lock();
        while !state.gate.is_locked() {
            let Some(id) = state.ready.dequeue_highest() else {
                break;
            };
            let (handler, arg0, arg1, fired) = {
                let slot = state.slots[id.index()]
                    .as_mut()
                    .expect("ready list references a vacant slot");
                slot.state = SwiState::Running;
                let fired = slot.trigger;
                slot.trigger = slot.arm_trigger;
                (Arc::clone(&slot.handler), slot.arg0, slot.arg1, fired)
            };
            state.last_trigger = fired;
            drop(state);

            self.emit_begin(id, fired);
            handler(arg0, arg1);
            self.emit_id(records::swi::END, id);

            state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(id.index()).and_then(|entry| entry.as_mut())
            {
                // A callback that re-armed itself is already Posted again;
                // only an untouched Running object goes back to Idle.
                if slot.state == SwiState::Running {
                    slot.state = SwiState::Idle;
                }
            }
        }
        state.pump_armed = false;
    }

    /// Trigger value captured when the currently-running callback was
    /// dispatched. Meaningful only from inside a callback.
    pub fn last_trigger(&self) -> u32 {
        self.state.lock().last_trigger
    }

    /// True while a pump has been requested and dispatch has not yet
    /// drained all ready work.
    pub fn is_pump_running(&self) -> bool {
        self.state.lock().pump_armed
    }

    /// Whether any object is queued on a ready list.
    pub fn has_ready_work(&self) -> bool {
        !self.state.lock().ready.is_empty()
    }

    /// Whether the calling context is executing inside the pump interrupt.
    pub fn in_interrupt_context(&self) -> bool {
        self.port.in_interrupt()
    }

    pub fn priority_of(&self, id: SwiId) -> Result<u8, SwiError> {
        Ok(self.state.lock().slot(id)?.priority)
    }

    pub fn trigger_of(&self, id: SwiId) -> Result<u32, SwiError> {
        Ok(self.state.lock().slot(id)?.trigger)
    }

    pub fn state_of(&self, id: SwiId) -> Result<SwiState, SwiError> {
        Ok(self.state.lock().slot(id)?.state)
    }

    /// The `Posted` transition primitive. Returns what the caller must do
    /// once the critical section ends: emit the post record and, when the
    /// pump was newly armed, raise it.
    fn post_locked(
        &self,
        state: &mut SchedState,
        id: SwiId,
    ) -> Result<Option<PostAction>, SwiError> {
        let priority = {
            let slot = state.slot_mut(id)?;
            if slot.state == SwiState::Posted {
                return Ok(None);
            }
            slot.state = SwiState::Posted;
            slot.priority
        };
        state.ready.enqueue(id, priority);

        let raise_pump = state.gate == Gate::Unlocked && !state.pump_armed;
        if raise_pump {
            state.pump_armed = true;
        }
        Ok(Some(PostAction {
            priority,
            raise_pump,
        }))
    }

    fn finish_post(&self, id: SwiId, action: Option<PostAction>) {
        if let Some(action) = action {
            self.emit_id_pri(records::swi::POST, id, action.priority);
            if action.raise_pump {
                self.emit(records::swi::PUMP_ARM, &[]);
                self.port.raise();
            }
        }
    }

    fn emit(&self, record: u8, payload: &[u8]) {
        if let Some(trace) = &self.trace {
            let _ = trace(record, payload, true);
        }
    }

    fn emit_id(&self, record: u8, id: SwiId) {
        self.emit(record, &(id.index() as u16).to_le_bytes());
    }

    fn emit_id_pri(&self, record: u8, id: SwiId, priority: u8) {
        let id_bytes = (id.index() as u16).to_le_bytes();
        self.emit(record, &[id_bytes[0], id_bytes[1], priority]);
    }

    fn emit_begin(&self, id: SwiId, trigger: u32) {
        let mut buf = [0u8; 6];
        buf[..2].copy_from_slice(&(id.index() as u16).to_le_bytes());
        buf[2..].copy_from_slice(&trigger.to_le_bytes());
        self.emit(records::swi::BEGIN, &buf);
    }
}
