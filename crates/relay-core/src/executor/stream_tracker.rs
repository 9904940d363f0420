//! Tracks a single upstream stream's timing and emptiness (spec.md §4.9,
//! Invariant 2, S3). One tracker per attempt: construct it right before the
//! first `rx_in.recv().await`, feed it every chunk as it arrives, and ask
//! [`Self::is_empty`] once the channel closes to decide whether the attempt
//! should be treated as a retryable empty-stream failure rather than a
//! successful zero-byte response.

use std::time::Instant;

pub struct StreamTracker {
    started_at: Instant,
    first_byte_at: Option<Instant>,
    chunk_count: u64,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            first_byte_at: None,
            chunk_count: 0,
        }
    }

    /// Record that a chunk arrived. Returns `true` the first time it's
    /// called (the caller's cue to transition the request's status to
    /// `streaming`, spec.md §4.9/§4.11).
    pub fn on_chunk(&mut self) -> bool {
        self.chunk_count += 1;
        if self.first_byte_at.is_none() {
            self.first_byte_at = Some(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn first_byte_time_ms(&self) -> Option<i64> {
        self.first_byte_at
            .map(|at| (at - self.started_at).as_millis() as i64)
    }

    pub fn response_time_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    /// True if the channel closed without ever delivering a chunk.
    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream_has_no_first_byte() {
        let tracker = StreamTracker::new();
        assert!(tracker.is_empty());
        assert_eq!(tracker.first_byte_time_ms(), None);
    }

    #[test]
    fn first_chunk_reports_transition_once() {
        let mut tracker = StreamTracker::new();
        assert!(tracker.on_chunk());
        assert!(!tracker.on_chunk());
        assert!(!tracker.is_empty());
        assert!(tracker.first_byte_time_ms().is_some());
    }
}
