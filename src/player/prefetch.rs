use std::collections::VecDeque;

/// Lines waiting to be resolved ahead of playback.
///
/// FIFO, deduplicated, and at most one index in flight. An index is never
/// both pending and in flight.
#[derive(Debug, Default)]
pub struct PrefetchQueue {
    pending: VecDeque<usize>,
    in_flight: Option<usize>,
}

impl PrefetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends indices in the given order, skipping ones already queued or
    /// for which `is_known` returns true. Returns how many were added.
    pub fn enqueue<I, F>(&mut self, indices: I, is_known: F) -> usize
    where
        I: IntoIterator<Item = usize>,
        F: Fn(usize) -> bool,
    {
        let mut added = 0;
        for index in indices {
            if self.contains(index) || is_known(index) {
                continue;
            }
            self.pending.push_back(index);
            added += 1;
        }
        added
    }

    /// Moves the head into the in-flight slot. `None` when the queue is empty
    /// or a resolution is already running.
    pub fn begin_next(&mut self) -> Option<usize> {
        if self.in_flight.is_some() {
            return None;
        }
        let index = self.pending.pop_front()?;
        self.in_flight = Some(index);
        Some(index)
    }

    /// Releases the in-flight slot, whatever the outcome of the resolution.
    pub fn finish(&mut self, index: usize) -> bool {
        if self.in_flight == Some(index) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    pub fn dequeue(&mut self, index: usize) -> bool {
        let before = self.pending.len();
        self.pending.retain(|&i| i != index);
        before != self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }

    pub fn contains(&self, index: usize) -> bool {
        self.in_flight == Some(index) || self.pending.contains(&index)
    }

    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.iter().copied()
    }

    /// Pending plus in flight.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const PROGRESS_START: u8 = 10;
const PROGRESS_STEP: u8 = 8;
const PROGRESS_CAP: u8 = 90;

/// Cosmetic progress for a resolution whose transport reports none.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedProgress {
    percent: u8,
}

impl Default for SimulatedProgress {
    fn default() -> Self {
        Self { percent: PROGRESS_START }
    }
}

impl SimulatedProgress {
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Next tick, or `None` once the cap is reached.
    pub fn advance(&mut self) -> Option<u8> {
        if self.percent >= PROGRESS_CAP {
            return None;
        }
        self.percent = (self.percent + PROGRESS_STEP).min(PROGRESS_CAP);
        Some(self.percent)
    }

    pub fn complete(&mut self) -> u8 {
        self.percent = 100;
        self.percent
    }
}
