use std::collections::VecDeque;

use switchboard_proto::CandidateInit;

/// Ordered holding pen for received candidates that cannot be applied
/// yet. Applying a candidate before the remote description lands is a
/// protocol violation most engines reject, so the buffer stays closed
/// until the driver opens it, then everything drains in arrival order
/// and later candidates pass straight through.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<CandidateInit>,
    open: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one received candidate. Returns the candidates now ready
    /// to apply: empty while closed, exactly the input once open.
    pub fn accept(&mut self, candidate: CandidateInit) -> Vec<CandidateInit> {
        if self.open {
            vec![candidate]
        } else {
            self.queue.push_back(candidate);
            Vec::new()
        }
    }

    /// Open the buffer and return everything held, in arrival order.
    /// Idempotent; a second open drains nothing.
    pub fn open(&mut self) -> Vec<CandidateInit> {
        self.open = true;
        self.queue.drain(..).collect()
    }

    /// Renegotiation reset: close the gate and discard held candidates.
    pub fn reset(&mut self) {
        self.open = false;
        self.queue.clear();
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tag: &str) -> CandidateInit {
        CandidateInit {
            candidate: format!("candidate:{tag}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test_timeout::timeout]
    fn closed_buffer_holds_in_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.accept(candidate("a")).is_empty());
        assert!(buffer.accept(candidate("b")).is_empty());
        assert!(buffer.accept(candidate("c")).is_empty());

        let drained = buffer.open();
        let tags: Vec<&str> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(tags, vec!["candidate:a", "candidate:b", "candidate:c"]);
    }

    #[test_timeout::timeout]
    fn open_buffer_passes_candidates_through() {
        let mut buffer = CandidateBuffer::new();
        buffer.open();
        assert_eq!(buffer.accept(candidate("a")), vec![candidate("a")]);
        // Nothing is retained once open; a re-open drains nothing.
        assert!(buffer.open().is_empty());
    }

    #[test_timeout::timeout]
    fn drained_candidates_are_delivered_exactly_once() {
        let mut buffer = CandidateBuffer::new();
        buffer.accept(candidate("a"));
        assert_eq!(buffer.open().len(), 1);
        assert!(buffer.open().is_empty());
    }

    #[test_timeout::timeout]
    fn reset_discards_and_closes() {
        let mut buffer = CandidateBuffer::new();
        buffer.accept(candidate("a"));
        buffer.open();
        buffer.reset();

        assert!(!buffer.is_open());
        // Held candidates from the previous negotiation are gone.
        assert!(buffer.accept(candidate("b")).is_empty());
        assert_eq!(buffer.open(), vec![candidate("b")]);
    }
}
