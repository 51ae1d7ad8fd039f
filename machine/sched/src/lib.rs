//! Deterministic event scheduler.
//!
//! The scheduler owns the monotonic cycle clock. All timed activity in the
//! machine is an event in one deadline-ordered queue; ties fire in
//! insertion order, so replaying the same schedule always produces the
//! same interleaving across billions of ticks.
//!
//! The machine drives one quantum at a time: ask for a budget bounded by
//! the earliest deadline, run a CPU sprint, report the cycles actually
//! spent, then drain due events. Event callbacks live in the machine (a
//! dispatch on [`EventTypeId`]); the queue itself stores only plain data,
//! which is what lets checkpoints capture it byte-for-byte.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// Default sprint length when no event bounds it sooner.
pub const DEFAULT_SLICE: i64 = 10_000;

/// Identifies a registered event type; stable across checkpoints because
/// machine init registers types in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTypeId(pub u32);

/// Scheduler run state, mirrored by the shell `status` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not running.
    Stopped,
    /// Running, but the CPU is parked in STOP waiting for an interrupt.
    Idle,
    /// Executing.
    Running,
}

/// How emulated time maps to host wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedMode {
    /// As fast as the host allows.
    #[default]
    Max,
    /// Pace to the configured clock frequency.
    Realtime,
    /// Pace to the original hardware clock.
    Hardware,
}

/// One pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Absolute cycle at which the event fires.
    pub deadline: u64,
    /// Insertion sequence; breaks deadline ties.
    pub seq: u64,
    /// Registered event type (selects the machine callback).
    pub kind: EventTypeId,
    /// Source tag, used for cancellation matching.
    pub source: u32,
    /// Opaque payload.
    pub data: u64,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Metadata for one registered event type.
#[derive(Debug, Clone)]
struct EventType {
    module: String,
    source: String,
    name: String,
}

/// The machine's cycle clock and event queue.
pub struct Scheduler {
    now: u64,
    seq: u64,
    queue: BinaryHeap<Reverse<Event>>,
    types: Vec<EventType>,
    status: Status,
    speed: SpeedMode,
    frequency_hz: u64,
    /// Cycle the current sprint is allowed to run to; used to decide when
    /// a newly scheduled event must cut the sprint short.
    sprint_end: u64,
}

impl Scheduler {
    /// Creates a scheduler, cold or from a checkpoint component.
    #[must_use]
    pub fn new(frequency_hz: u64, chk: Option<&mut CheckpointReader>) -> Self {
        let mut s = Self {
            now: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            types: Vec::new(),
            status: Status::Stopped,
            speed: SpeedMode::default(),
            frequency_hz,
            sprint_end: 0,
        };
        if let Some(r) = chk {
            r.enter_component();
            s.now = r.get_u64();
            s.seq = r.get_u64();
            s.frequency_hz = r.get_u64();
            let n = r.get_u32();
            for _ in 0..n {
                let deadline = r.get_u64();
                let seq = r.get_u64();
                let kind = EventTypeId(r.get_u32());
                let source = r.get_u32();
                let data = r.get_u64();
                s.queue.push(Reverse(Event { deadline, seq, kind, source, data }));
            }
            r.exit_component();
        }
        s
    }

    /// Registers an event type. Must be called in the same order on cold
    /// boot and on restore so ids in checkpointed events stay valid.
    pub fn new_event_type(&mut self, module: &str, source: &str, name: &str) -> EventTypeId {
        let id = EventTypeId(self.types.len() as u32);
        self.types.push(EventType {
            module: module.to_owned(),
            source: source.to_owned(),
            name: name.to_owned(),
        });
        id
    }

    /// Diagnostic name of an event type.
    #[must_use]
    pub fn type_name(&self, id: EventTypeId) -> &str {
        self.types.get(id.0 as usize).map_or("?", |t| t.name.as_str())
    }

    /// Diagnostic module/source of an event type.
    #[must_use]
    pub fn type_origin(&self, id: EventTypeId) -> (&str, &str) {
        self.types
            .get(id.0 as usize)
            .map_or(("?", "?"), |t| (t.module.as_str(), t.source.as_str()))
    }

    /// Current cycle.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Emulated clock frequency.
    #[must_use]
    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    /// Sets the emulated clock frequency used for ns conversion and
    /// wall-clock pacing.
    pub fn set_frequency(&mut self, hz: u64) {
        self.frequency_hz = hz.max(1);
    }

    /// Selects the speed mode.
    pub fn set_speed(&mut self, speed: SpeedMode) {
        self.speed = speed;
    }

    /// Current speed mode.
    #[must_use]
    pub fn speed(&self) -> SpeedMode {
        self.speed
    }

    /// Converts a nanosecond delay to cycles at the current frequency.
    #[must_use]
    pub fn ns_to_cycles(&self, ns: u64) -> u64 {
        (u128::from(ns) * u128::from(self.frequency_hz) / 1_000_000_000) as u64
    }

    /// Schedules an event `cycle_delay + ns_delay` from now.
    ///
    /// Returns true if the deadline lands inside the current sprint
    /// window, in which case the caller should cut the sprint short.
    pub fn schedule(&mut self, kind: EventTypeId, source: u32, data: u64, cycle_delay: u64, ns_delay: u64) -> bool {
        let deadline = self.now + cycle_delay + self.ns_to_cycles(ns_delay);
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(Event { deadline, seq, kind, source, data }));
        deadline < self.sprint_end
    }

    /// Removes every pending event matching `(kind, source)`.
    pub fn remove_event(&mut self, kind: EventTypeId, source: u32) {
        self.retain(|e| !(e.kind == kind && e.source == source));
    }

    /// Removes every pending event matching `(kind, source, data)`.
    pub fn remove_event_by_data(&mut self, kind: EventTypeId, source: u32, data: u64) {
        self.retain(|e| !(e.kind == kind && e.source == source && e.data == data));
    }

    fn retain(&mut self, keep: impl Fn(&Event) -> bool) {
        let mut kept: Vec<Reverse<Event>> = std::mem::take(&mut self.queue).into_vec();
        kept.retain(|Reverse(e)| keep(e));
        self.queue = kept.into();
    }

    /// Cycles until the earliest pending deadline, if any.
    #[must_use]
    pub fn until_next_event(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse(e)| e.deadline.saturating_sub(self.now))
    }

    /// Computes the next sprint budget: the default slice, shortened so
    /// the clock never runs past the earliest deadline.
    pub fn next_budget(&mut self) -> i64 {
        let budget = match self.until_next_event() {
            Some(0) => 0,
            Some(d) => DEFAULT_SLICE.min(d as i64),
            None => DEFAULT_SLICE,
        };
        self.sprint_end = self.now + budget as u64;
        budget
    }

    /// Advances the clock by the cycles a sprint actually consumed.
    pub fn advance(&mut self, spent: i64) {
        debug_assert!(spent >= 0);
        self.now += spent as u64;
    }

    /// Pops the next event whose deadline has arrived.
    ///
    /// Events scheduled during a callback for the current cycle carry a
    /// later sequence number, so they drain after everything already due.
    pub fn pop_due(&mut self) -> Option<Event> {
        match self.queue.peek() {
            Some(Reverse(e)) if e.deadline <= self.now => {
                let Reverse(e) = self.queue.pop().expect("peeked");
                Some(e)
            }
            _ => None,
        }
    }

    /// Count of pending events (diagnostics and tests).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Marks the scheduler running.
    pub fn start(&mut self) {
        self.status = Status::Running;
    }

    /// Marks the scheduler stopped.
    pub fn stop(&mut self) {
        self.status = Status::Stopped;
    }

    /// Current status, with `Idle` reported while the CPU sits in STOP.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Records the CPU-idle state observed at the last quantum.
    pub fn set_idle(&mut self, idle: bool) {
        if self.status != Status::Stopped {
            self.status = if idle { Status::Idle } else { Status::Running };
        }
    }

    /// Host sleep needed to pace the given cycles, per the speed mode.
    #[must_use]
    pub fn pacing_delay(&self, cycles: u64) -> Option<Duration> {
        match self.speed {
            SpeedMode::Max => None,
            SpeedMode::Realtime | SpeedMode::Hardware => {
                let ns = u128::from(cycles) * 1_000_000_000 / u128::from(self.frequency_hz);
                Some(Duration::from_nanos(ns as u64))
            }
        }
    }

    /// Serializes clock, sequence counter, and the pending queue.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u64(self.now);
            w.put_u64(self.seq);
            w.put_u64(self.frequency_hz);
            let events: Vec<&Event> = self.queue.iter().map(|Reverse(e)| e).collect();
            w.put_u32(events.len() as u32);
            // Heap iteration order is arbitrary; the heap re-establishes
            // ordering on restore, and seq numbers preserve tie-breaks.
            for e in events {
                w.put_u64(e.deadline);
                w.put_u64(e.seq);
                w.put_u32(e.kind.0);
                w.put_u32(e.source);
                w.put_u64(e.data);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> Scheduler {
        Scheduler::new(7_833_600, None)
    }

    #[test]
    fn events_fire_in_deadline_order() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        s.schedule(t, 1, 0, 300, 0);
        s.schedule(t, 2, 0, 100, 0);
        s.schedule(t, 3, 0, 200, 0);
        s.advance(300);
        let order: Vec<u32> = std::iter::from_fn(|| s.pop_due()).map(|e| e.source).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn same_deadline_ties_break_by_insertion() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        for src in 0..5 {
            s.schedule(t, src, 0, 50, 0);
        }
        s.advance(50);
        let order: Vec<u32> = std::iter::from_fn(|| s.pop_due()).map(|e| e.source).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn budget_bounded_by_earliest_deadline() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        s.schedule(t, 1, 0, 123, 0);
        assert_eq!(s.next_budget(), 123);
        s.advance(123);
        assert!(s.pop_due().is_some());
        assert_eq!(s.next_budget(), DEFAULT_SLICE);
    }

    #[test]
    fn event_inside_sprint_window_requests_reschedule() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        let _ = s.next_budget(); // window [0, DEFAULT_SLICE)
        assert!(s.schedule(t, 1, 0, 10, 0));
        assert!(!s.schedule(t, 1, 0, DEFAULT_SLICE as u64 + 10, 0));
    }

    #[test]
    fn event_scheduled_during_drain_fires_after_queued_ones() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        s.schedule(t, 1, 0, 10, 0);
        s.schedule(t, 2, 0, 10, 0);
        s.advance(10);
        let first = s.pop_due().unwrap();
        assert_eq!(first.source, 1);
        // Callback schedules another event for "now".
        s.schedule(t, 9, 0, 0, 0);
        assert_eq!(s.pop_due().unwrap().source, 2);
        assert_eq!(s.pop_due().unwrap().source, 9);
        assert!(s.pop_due().is_none());
    }

    #[test]
    fn remove_event_matches_callback_and_source() {
        let mut s = sched();
        let t1 = s.new_event_type("test", "a", "tick");
        let t2 = s.new_event_type("test", "b", "tock");
        s.schedule(t1, 1, 0, 10, 0);
        s.schedule(t1, 2, 0, 10, 0);
        s.schedule(t2, 1, 0, 10, 0);
        s.remove_event(t1, 1);
        assert_eq!(s.pending(), 2);
        s.advance(10);
        let srcs: Vec<(u32, EventTypeId)> =
            std::iter::from_fn(|| s.pop_due()).map(|e| (e.source, e.kind)).collect();
        assert_eq!(srcs, vec![(2, t1), (1, t2)]);
    }

    #[test]
    fn remove_by_data_filters_payload() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        s.schedule(t, 1, 100, 10, 0);
        s.schedule(t, 1, 200, 10, 0);
        s.remove_event_by_data(t, 1, 100);
        s.advance(10);
        assert_eq!(s.pop_due().unwrap().data, 200);
        assert!(s.pop_due().is_none());
    }

    #[test]
    fn ns_delay_uses_frequency() {
        let mut s = sched();
        s.set_frequency(1_000_000_000); // 1 GHz: 1 ns = 1 cycle
        assert_eq!(s.ns_to_cycles(500), 500);
        s.set_frequency(500_000_000);
        assert_eq!(s.ns_to_cycles(500), 250);
    }

    #[test]
    fn status_transitions() {
        let mut s = sched();
        assert_eq!(s.status(), Status::Stopped);
        s.start();
        assert_eq!(s.status(), Status::Running);
        s.set_idle(true);
        assert_eq!(s.status(), Status::Idle);
        s.set_idle(false);
        assert_eq!(s.status(), Status::Running);
        s.stop();
        s.set_idle(true);
        assert_eq!(s.status(), Status::Stopped, "idle does not resurrect a stopped scheduler");
    }

    #[test]
    fn checkpoint_round_trips_queue() {
        let mut s = sched();
        let t = s.new_event_type("test", "a", "tick");
        s.schedule(t, 1, 11, 100, 0);
        s.schedule(t, 2, 22, 50, 0);
        s.advance(30);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        s.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let mut back = Scheduler::new(0, Some(&mut r));
        assert_eq!(back.now(), 30);
        assert_eq!(back.frequency_hz(), s.frequency_hz());
        back.advance(70);
        assert_eq!(back.pop_due().unwrap().source, 2);
        assert_eq!(back.pop_due().unwrap().source, 1);
    }
}
