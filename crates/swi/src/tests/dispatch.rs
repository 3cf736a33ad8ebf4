//! Behavioral tests driving the full post → pump → dispatch path over the
//! host port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use once_cell::sync::OnceCell;

use crate::sync::Arc;
use crate::{scheduler, SwiParams, SwiScheduler};

fn recording_handler(order: &Arc<Mutex<Vec<u8>>>, tag: u8) -> crate::SwiHandler {
    let order = Arc::clone(order);
    Arc::new(move |_, _| order.lock().unwrap().push(tag))
}

#[test]
fn strict_priority_across_levels() {
    let sched = SwiScheduler::builder().build();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for pri in [0u8, 3, 1] {
        ids.push(
            sched
                .construct(
                    recording_handler(&order, pri),
                    &SwiParams::new().with_priority(pri),
                )
                .unwrap(),
        );
    }

    let key = sched.disable();
    for id in &ids {
        sched.post(*id).unwrap();
    }
    sched.restore(key);

    assert_eq!(*order.lock().unwrap(), vec![3, 1, 0]);
    assert!(!sched.has_ready_work());
}

#[test]
fn fifo_within_one_priority() {
    let sched = SwiScheduler::builder().build();
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = sched
        .construct(recording_handler(&order, b'a'), &SwiParams::new().with_priority(2))
        .unwrap();
    let b = sched
        .construct(recording_handler(&order, b'b'), &SwiParams::new().with_priority(2))
        .unwrap();

    let key = sched.disable();
    sched.post(a).unwrap();
    sched.post(b).unwrap();
    sched.restore(key);

    assert_eq!(*order.lock().unwrap(), vec![b'a', b'b']);
}

#[test]
fn open_gate_runs_posted_work_immediately() {
    let sched = SwiScheduler::builder().build();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let id = sched
        .construct(
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &SwiParams::new(),
        )
        .unwrap();

    sched.post(id).unwrap();
    // The host pump delivered synchronously; nothing is left queued.
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!sched.has_ready_work());
    assert!(!sched.is_pump_running());
}

#[test]
fn self_repost_runs_exactly_once_more() {
    let sched = SwiScheduler::builder().build();
    let runs = Arc::new(AtomicUsize::new(0));
    let self_id = Arc::new(OnceCell::new());

    let counter = Arc::clone(&runs);
    let reposter = Arc::downgrade(&sched);
    let own_id = Arc::clone(&self_id);
    let id = sched
        .construct(
            Arc::new(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let sched = reposter.upgrade().unwrap();
                    let id = *own_id.get().unwrap();
                    // Posting twice while Running must still queue one run.
                    sched.post(id).unwrap();
                    sched.post(id).unwrap();
                }
            }),
            &SwiParams::new(),
        )
        .unwrap();
    self_id.set(id).unwrap();

    sched.post(id).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!sched.has_ready_work());
}

#[test]
fn higher_priority_posted_mid_dispatch_overtakes_queued_work() {
    let sched = SwiScheduler::builder().build();
    let order = Arc::new(Mutex::new(Vec::new()));

    let low = sched
        .construct(recording_handler(&order, 0), &SwiParams::new().with_priority(0))
        .unwrap();
    let high = sched
        .construct(recording_handler(&order, 3), &SwiParams::new().with_priority(3))
        .unwrap();

    let log = Arc::clone(&order);
    let poster = Arc::downgrade(&sched);
    let mid = sched
        .construct(
            Arc::new(move |_, _| {
                log.lock().unwrap().push(1);
                poster.upgrade().unwrap().post(high).unwrap();
            }),
            &SwiParams::new().with_priority(1),
        )
        .unwrap();

    let key = sched.disable();
    sched.post(mid).unwrap();
    sched.post(low).unwrap();
    sched.restore(key);

    // The high-priority object armed inside mid's callback ran before the
    // already-queued low-priority one.
    assert_eq!(*order.lock().unwrap(), vec![1, 3, 0]);
}

#[test]
fn last_trigger_reports_the_armed_value() {
    let sched = SwiScheduler::builder().build();
    let seen = Arc::new(Mutex::new(None));

    let probe = Arc::clone(&seen);
    let inspector = Arc::downgrade(&sched);
    let self_id = Arc::new(OnceCell::new());
    let own_id = Arc::clone(&self_id);
    let id = sched
        .construct(
            Arc::new(move |_, _| {
                let sched = inspector.upgrade().unwrap();
                let rearmed = sched.trigger_of(*own_id.get().unwrap()).unwrap();
                *probe.lock().unwrap() = Some((sched.last_trigger(), rearmed));
            }),
            &SwiParams::new(),
        )
        .unwrap();
    self_id.set(id).unwrap();

    sched.or_mask(id, 0b101).unwrap();

    // The callback saw the trigger that armed it, and the live trigger had
    // already been reset to the re-arm value.
    assert_eq!(*seen.lock().unwrap(), Some((0b101, 0)));
}

#[test]
fn callback_arguments_are_fixed_at_construction() {
    let sched = SwiScheduler::builder().build();
    let seen = Arc::new(Mutex::new(None));

    let probe = Arc::clone(&seen);
    let id = sched
        .construct(
            Arc::new(move |arg0, arg1| {
                *probe.lock().unwrap() = Some((arg0, arg1));
            }),
            &SwiParams::new().with_args(0xdead, 0xbeef),
        )
        .unwrap();

    sched.post(id).unwrap();
    assert_eq!(*seen.lock().unwrap(), Some((0xdead, 0xbeef)));
}

#[test]
fn interrupt_context_is_visible_only_inside_callbacks() {
    let sched = SwiScheduler::builder().build();
    let observed = Arc::new(Mutex::new(None));

    let probe = Arc::clone(&observed);
    let inspector = Arc::downgrade(&sched);
    let id = sched
        .construct(
            Arc::new(move |_, _| {
                let sched = inspector.upgrade().unwrap();
                *probe.lock().unwrap() = Some(sched.in_interrupt_context());
            }),
            &SwiParams::new(),
        )
        .unwrap();

    assert!(!sched.in_interrupt_context());
    sched.post(id).unwrap();
    assert_eq!(*observed.lock().unwrap(), Some(true));
    assert!(!sched.in_interrupt_context());
}

#[test]
fn create_and_delete_round_trip() {
    let sched = SwiScheduler::builder().build();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let id = sched
        .create(
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &SwiParams::new().with_priority(2).with_name("worker"),
        )
        .unwrap();

    sched.post(id).unwrap();
    sched.delete(id).unwrap();
    assert!(sched.post(id).is_err());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn global_scheduler_is_shared_and_dispatches() {
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let id = scheduler()
        .construct(
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &SwiParams::new().with_priority(1),
        )
        .unwrap();

    scheduler().post(id).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    scheduler().destruct(id).unwrap();
}
