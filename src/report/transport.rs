//! Bounded per-tracker inboxes.
//!
//! Each tracker owns one inbox; every processor holds a sending handle to
//! each of them. Delivery is FIFO per (sender, receiver) pair and the
//! receive-side capacity is `send_hwm x processors`, so a full inbox
//! blocks the sending processor rather than dropping frames. Sequence
//! numbers ride along so a lossy transport can still be detected.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The receiving tracker has exited and dropped its inbox.
    #[error("tracker inbox disconnected")]
    Disconnected,
}

/// Sending half of a tracker inbox.
#[derive(Clone)]
pub struct InboxSender {
    inner: Sender<Vec<u8>>,
}

impl InboxSender {
    /// Blocks while the inbox is at its high-water mark.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.inner
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Non-blocking variant; returns the frame on backpressure.
    pub fn try_send(&self, frame: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        self.inner.try_send(frame)
    }
}

/// Receiving half of a tracker inbox.
pub type InboxReceiver = Receiver<Vec<u8>>;

/// Creates one bounded inbox per tracker.
///
/// `send_hwm` is the per-(processor, tracker) high-water mark; the inbox
/// capacity scales with the number of processors feeding it.
pub fn tracker_inboxes(
    tracker_count: usize,
    processor_count: usize,
    send_hwm: usize,
) -> (Vec<InboxSender>, Vec<InboxReceiver>) {
    let capacity = send_hwm * processor_count;
    let mut senders = Vec::with_capacity(tracker_count);
    let mut receivers = Vec::with_capacity(tracker_count);

    for _ in 0..tracker_count {
        let (tx, rx) = bounded(capacity);
        senders.push(InboxSender { inner: tx });
        receivers.push(rx);
    }

    (senders, receivers)
}

/// Tracker-side sequence accounting for one inbox.
///
/// Frames from each sender must arrive with consecutive sequence numbers;
/// a gap means the transport dropped messages. Losses are counted and
/// reported with the interval result, never retried.
#[derive(Debug)]
pub struct SequenceTracker {
    expected: Vec<Option<u32>>,
    lost: u64,
}

impl SequenceTracker {
    pub fn new(processor_count: usize) -> Self {
        SequenceTracker {
            expected: vec![None; processor_count],
            lost: 0,
        }
    }

    /// Records an observed (sender, seqno) pair, counting any gap.
    pub fn observe(&mut self, sender: u8, seqno: u32) {
        let slot = match self.expected.get_mut(usize::from(sender)) {
            Some(slot) => slot,
            None => {
                warn!(sender, "frame from unknown sender id");
                return;
            }
        };

        if let Some(expected) = *slot {
            if seqno != expected {
                let gap = seqno.wrapping_sub(expected);
                self.lost += u64::from(gap);
                warn!(sender, expected, got = seqno, gap, "sequence gap on tracker inbox");
            }
        }
        *slot = Some(seqno.wrapping_add(1));
    }

    /// Total messages lost since the last [`SequenceTracker::take_lost`].
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Returns and resets the loss counter; called once per interval.
    pub fn take_lost(&mut self) -> u64 {
        std::mem::take(&mut self.lost)
    }

    /// Forgets all per-sender state; used by RESET.
    pub fn clear(&mut self) {
        self.expected.fill(None);
        self.lost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_fifo_per_sender() {
        let (txs, rxs) = tracker_inboxes(1, 1, 8);
        txs[0].send(vec![1]).expect("send");
        txs[0].send(vec![2]).expect("send");
        txs[0].send(vec![3]).expect("send");

        assert_eq!(rxs[0].recv().expect("recv"), vec![1]);
        assert_eq!(rxs[0].recv().expect("recv"), vec![2]);
        assert_eq!(rxs[0].recv().expect("recv"), vec![3]);
    }

    #[test]
    fn test_inbox_capacity_scales_with_processors() {
        let (txs, _rxs) = tracker_inboxes(1, 3, 2);
        for _ in 0..6 {
            txs[0].try_send(vec![0]).expect("within capacity");
        }
        assert!(matches!(
            txs[0].try_send(vec![0]),
            Err(TrySendError::Full(_))
        ));
    }

    #[test]
    fn test_send_to_dropped_inbox_errors() {
        let (txs, rxs) = tracker_inboxes(1, 1, 4);
        drop(rxs);
        assert!(matches!(
            txs[0].send(vec![0]),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_sequence_tracker_counts_gaps() {
        let mut seq = SequenceTracker::new(2);
        seq.observe(0, 0);
        seq.observe(0, 1);
        assert_eq!(seq.lost(), 0);

        // Drop seqnos 2 and 3.
        seq.observe(0, 4);
        assert_eq!(seq.lost(), 2);

        // Other senders are tracked independently.
        seq.observe(1, 0);
        assert_eq!(seq.lost(), 2);

        assert_eq!(seq.take_lost(), 2);
        assert_eq!(seq.lost(), 0);
    }

    #[test]
    fn test_sequence_tracker_first_frame_sets_baseline() {
        let mut seq = SequenceTracker::new(1);
        // A non-zero first seqno is a baseline, not a loss.
        seq.observe(0, 10);
        assert_eq!(seq.lost(), 0);
        seq.observe(0, 11);
        assert_eq!(seq.lost(), 0);
    }

    #[test]
    fn test_sequence_tracker_clear() {
        let mut seq = SequenceTracker::new(1);
        seq.observe(0, 0);
        seq.observe(0, 5);
        assert_eq!(seq.lost(), 4);

        seq.clear();
        assert_eq!(seq.lost(), 0);
        // Post-reset frames establish a fresh baseline.
        seq.observe(0, 100);
        assert_eq!(seq.lost(), 0);
    }
}
