use core::{cmp::Reverse, time::Duration};
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

/// Shortest period a repeating timer may have
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

struct Entry<F> {
    /// `None` for one-shots
    period: Option<Duration>,
    /// Taken out while the callback runs
    callback: Option<F>,
    deadline: Option<Instant>,
}

/// Cooperative timers for the dispatch loop.
///
/// Periodic timers start counting at [`arm`](Self::arm) and are rescheduled
/// one period after each run completes, so they drift rather than catch up.
/// One-shot timers count from when they are added.
pub(crate) struct TimerWheel<F> {
    next_id: u64,
    armed: bool,
    entries: HashMap<TimerId, Entry<F>>,
    queue: BinaryHeap<Reverse<(Instant, TimerId)>>,
}

impl<F> TimerWheel<F> {
    pub fn new() -> Self {
        Self { next_id: 1, armed: false, entries: HashMap::new(), queue: BinaryHeap::new() }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn insert(&mut self, period: Option<Duration>, callback: F) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Entry { period, callback: Some(callback), deadline: None });
        id
    }

    fn schedule(&mut self, id: TimerId, at: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.deadline = Some(at);
            self.queue.push(Reverse((at, id)));
        }
    }

    pub fn add_periodic(&mut self, period: Duration, callback: F) -> TimerId {
        let period = period.max(MIN_PERIOD);
        let id = self.insert(Some(period), callback);
        if self.armed {
            self.schedule(id, Instant::now() + period);
        }
        id
    }

    pub fn add_oneshot(&mut self, delay: Duration, callback: F) -> TimerId {
        let id = self.insert(None, callback);
        self.schedule(id, Instant::now() + delay);
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Starts every periodic timer. Later calls do nothing.
    pub fn arm(&mut self, now: Instant) {
        if self.armed {
            return;
        }
        self.armed = true;

        let waiting = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_none())
            .filter_map(|(id, e)| Some((*id, e.period?)))
            .collect::<Vec<_>>();

        for (id, period) in waiting {
            self.schedule(id, now + period);
        }
    }

    fn is_current(&self, at: Instant, id: TimerId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.deadline == Some(at))
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((at, id))) = self.queue.peek() {
            if self.is_current(at, id) {
                return Some(at);
            }
            self.queue.pop();
        }
        None
    }

    /// Takes out the next callback due at `now`; hand it back with
    /// [`restore`](Self::restore) once it has run.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, F)> {
        loop {
            let at = self.next_deadline()?;
            if at > now {
                return None;
            }

            let Reverse((_, id)) = self.queue.pop()?;
            let entry = self.entries.get_mut(&id)?;
            entry.deadline = None;

            match entry.callback.take() {
                Some(callback) => return Some((id, callback)),
                None => continue,
            }
        }
    }

    /// Returns a callback after it ran. Periodic timers are rescheduled from
    /// `now`; one-shots and timers cancelled during the run are dropped.
    pub fn restore(&mut self, id: TimerId, callback: F, now: Instant) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        match entry.period {
            Some(period) => {
                entry.callback = Some(callback);
                self.schedule(id, now + period);
            }
            None => {
                self.entries.remove(&id);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
