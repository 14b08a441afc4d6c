//! Timed callback queue driving scheduling ticks.
//!
//! Entries are (time, callback) pairs; a callback returns the absolute time
//! at which it wants to run again, or `None` to leave the queue. The host
//! clock drives `advance_to`; tests drive it synthetically, the CLI render
//! path steps it through a fixed span.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::warn;

pub type TickFn = Box<dyn FnMut(f64) -> Option<f64> + Send>;

struct Entry {
    time: f64,
    seq: u64,
    callback: TickFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest entry surfaces.
        // Sequence numbers keep same-time entries in insertion order.
        other
            .time
            .total_cmp(&self.time)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct Scheduler {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to first run at `time`.
    pub fn add(&mut self, time: f64, callback: impl FnMut(f64) -> Option<f64> + Send + 'static) {
        self.push(time, Box::new(callback));
    }

    /// Earliest pending run time, if any.
    pub fn next_due(&self) -> Option<f64> {
        self.queue.peek().map(|entry| entry.time)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Run every entry due at or before `now`, in time order. Each callback
    /// receives its own scheduled time (not `now`), so late driving does not
    /// skip ticks. Returns the number of callbacks run.
    pub fn advance_to(&mut self, now: f64) -> usize {
        let mut ran = 0usize;
        while let Some(entry) = self.queue.peek() {
            if entry.time > now {
                break;
            }
            let mut entry = self.queue.pop().expect("peeked entry");
            let scheduled = entry.time;
            ran += 1;
            match (entry.callback)(scheduled) {
                Some(next) if next > scheduled => self.push(next, entry.callback),
                Some(next) => {
                    // A non-advancing reschedule would spin the queue forever.
                    warn!("Dropping callback rescheduled at {next} <= {scheduled}");
                }
                None => {}
            }
        }
        ran
    }

    fn push(&mut self, time: f64, callback: TickFn) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry {
            time,
            seq,
            callback,
        });
    }
}
