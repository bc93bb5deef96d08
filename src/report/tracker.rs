//! IP tracker workers.
//!
//! Each tracker owns the aggregation state for one shard of the address
//! space. It accumulates updates into the current interval's maps,
//! records which processors have ended which intervals, and finalizes an
//! interval once every processor has reported its end. The finalized
//! tally is published through a mutex-guarded slot the merger polls.
//!
//! Interval-end messages can arrive out of order across processors, so a
//! second (`next`) interval accumulates in parallel: updates from a
//! processor that has already ended the current interval belong to the
//! next one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReportOptions;
use crate::report::message::{decode, TrackerFrame};
use crate::report::tally::{IntervalMaps, IpEntry, MetricTally};
use crate::report::transport::{InboxReceiver, SequenceTracker};
use crate::tag::TagKey;

/// How long a tracker sleeps on an empty inbox before re-polling.
const POLL_BACKOFF: Duration = Duration::from_millis(10);

/// How long a tracker sleeps while the merger still holds the previous
/// interval's result.
const RESULT_BACKOFF: Duration = Duration::from_micros(100);

/// Tracker lifecycle as visible to the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltPhase {
    Running,
    /// Some processors have sent HALT; queued work is still draining.
    Draining,
    /// The tracker has exited; no further results will appear.
    Halted,
}

/// An interval for which some but not all processors have reported end.
#[derive(Debug)]
struct OutstandingInterval {
    interval_ts: u32,
    reported: Vec<bool>,
    count: usize,
}

/// Merger-visible state, guarded by a single mutex per tracker.
/// Critical sections are O(1): pointer swaps and timestamp updates.
#[derive(Debug)]
pub struct TrackerSlot {
    /// Tally of the most recently finalized interval, taken by the merger.
    pub last_result: Option<HashMap<TagKey, MetricTally>>,
    /// Timestamp of the last finalized interval; monotonic non-decreasing.
    pub last_ts: u32,
    pub halt_phase: HaltPhase,
    /// Messages lost on this inbox since the merger last collected.
    pub lost_messages: u64,
    outstanding: VecDeque<OutstandingInterval>,
}

/// Shared handle the merger polls with `try_lock`.
#[derive(Debug)]
pub struct TrackerShared {
    pub slot: Mutex<TrackerSlot>,
}

impl TrackerShared {
    pub fn new() -> Self {
        TrackerShared {
            slot: Mutex::new(TrackerSlot {
                last_result: None,
                last_ts: 0,
                halt_phase: HaltPhase::Running,
                lost_messages: 0,
                outstanding: VecDeque::new(),
            }),
        }
    }
}

impl Default for TrackerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// One IP tracker worker.
pub struct Tracker {
    id: usize,
    opts: Arc<ReportOptions>,
    inbox: InboxReceiver,
    shared: Arc<TrackerShared>,
    curr: IntervalMaps,
    next: IntervalMaps,
    /// Rotated-out IP entries, freed as a group on the next rotation.
    prev_ips: Option<HashMap<u32, IpEntry>>,
    seq: SequenceTracker,
    halts_seen: usize,
}

impl Tracker {
    pub fn new(
        id: usize,
        opts: Arc<ReportOptions>,
        inbox: InboxReceiver,
        shared: Arc<TrackerShared>,
    ) -> Self {
        let processor_count = opts.processor_count;
        Tracker {
            id,
            opts,
            inbox,
            shared,
            curr: IntervalMaps::new(),
            next: IntervalMaps::new(),
            prev_ips: None,
            seq: SequenceTracker::new(processor_count),
            halts_seen: 0,
        }
    }

    /// Worker loop; exits once every processor has sent HALT.
    pub fn run(mut self) {
        loop {
            match self.inbox.recv_timeout(POLL_BACKOFF) {
                Ok(raw) => {
                    let frame = match decode(&raw) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(tracker = self.id, error = %e, "discarding undecodable frame");
                            continue;
                        }
                    };
                    self.handle_frame(frame);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(tracker = self.id, "inbox closed");
                    break;
                }
            }

            if self.shared.slot.lock().halt_phase == HaltPhase::Halted {
                break;
            }
        }
        info!(tracker = self.id, "tracker exiting");
    }

    /// Dispatches one decoded frame. Split out from [`Tracker::run`] so
    /// the message handling can be exercised without threads.
    pub fn handle_frame(&mut self, frame: TrackerFrame) {
        self.seq.observe(frame.sender(), frame.seqno());

        match frame {
            TrackerFrame::Update { sender, updates, .. } => {
                self.handle_update(sender, &updates);
            }
            TrackerFrame::Interval {
                sender, timestamp, ..
            } => {
                self.handle_interval(sender, timestamp);
            }
            TrackerFrame::Halt { .. } => {
                self.handle_halt();
            }
            TrackerFrame::Reset { .. } => {
                self.handle_reset();
            }
        }
    }

    fn handle_update(&mut self, sender: u8, updates: &[crate::report::message::IpUpdate]) {
        // A sender that has already ended the accumulating interval is
        // feeding the next one.
        let use_next = {
            let slot = self.shared.slot.lock();
            slot.outstanding
                .iter()
                .any(|o| *o.reported.get(usize::from(sender)).unwrap_or(&false))
        };

        let maps = if use_next { &mut self.next } else { &mut self.curr };
        for update in updates {
            maps.absorb(update, self.opts.src_ip_counting, self.opts.dst_ip_counting);
        }
    }

    fn handle_interval(&mut self, sender: u8, timestamp: u32) {
        if timestamp == 0 {
            return;
        }

        let complete = {
            let mut slot = self.shared.slot.lock();

            // Stale or duplicate markers for already-finalized intervals.
            if timestamp <= slot.last_ts {
                return;
            }

            match update_outstanding(
                &mut slot.outstanding,
                timestamp,
                self.opts.processor_count,
                sender,
                self.id,
            ) {
                Some(ts) => ts,
                None => return,
            }
        };

        // The merger has not taken the previous tally yet when intervals
        // end back-to-back (full-speed replay); publishing would lose it.
        // Only this thread writes the slot, so waiting here is safe.
        let mut waited = false;
        let freed_ips = loop {
            let mut slot = self.shared.slot.lock();
            if slot.last_result.is_some() {
                drop(slot);
                if !waited {
                    debug!(
                        tracker = self.id,
                        interval = complete,
                        "waiting for merger to collect previous result"
                    );
                    waited = true;
                }
                std::thread::sleep(RESULT_BACKOFF);
                continue;
            }

            let finished = std::mem::replace(&mut self.curr, std::mem::take(&mut self.next));
            slot.last_result = Some(finished.tallies);
            slot.last_ts = complete;
            slot.lost_messages += self.seq.take_lost();

            if self.halts_seen >= self.opts.processor_count && slot.outstanding.is_empty() {
                info!(tracker = self.id, "tracker halting after final interval");
                slot.halt_phase = HaltPhase::Halted;
            }

            debug!(tracker = self.id, interval = complete, "interval finalized");
            // Rotated-out IP entries are freed after the mutex is released.
            break self.prev_ips.replace(finished.ips);
        };

        drop(freed_ips);
    }

    fn handle_halt(&mut self) {
        self.halts_seen += 1;
        if self.halts_seen < self.opts.processor_count {
            let mut slot = self.shared.slot.lock();
            if slot.halt_phase == HaltPhase::Running {
                slot.halt_phase = HaltPhase::Draining;
            }
            return;
        }

        // Every sender has halted; sender FIFO means nothing else can
        // complete an outstanding interval now.
        let mut slot = self.shared.slot.lock();
        while let Some(stale) = slot.outstanding.pop_front() {
            warn!(
                tracker = self.id,
                interval = stale.interval_ts,
                reports = stale.count,
                "halting with incomplete interval, discarding"
            );
        }
        slot.halt_phase = HaltPhase::Halted;
        info!(tracker = self.id, "tracker has been halted");
    }

    fn handle_reset(&mut self) {
        self.curr = IntervalMaps::new();
        self.next = IntervalMaps::new();
        self.prev_ips = None;
        self.seq.clear();

        let mut slot = self.shared.slot.lock();
        slot.outstanding.clear();
        slot.lost_messages = 0;
        // last_result / last_ts survive a reset.
        debug!(tracker = self.id, "tracker state reset");
    }
}

/// Records an interval-end report and returns the timestamp when the
/// report was the last one the tracker was waiting on.
///
/// Completion prunes the completed entry and any older incomplete ones;
/// the missing messages for those intervals will never arrive.
fn update_outstanding(
    outstanding: &mut VecDeque<OutstandingInterval>,
    ts: u32,
    limit: usize,
    sender: u8,
    tracker_id: usize,
) -> Option<u32> {
    let completed = match outstanding.iter_mut().find(|o| o.interval_ts == ts) {
        Some(entry) => {
            let idx = usize::from(sender);
            if idx < entry.reported.len() && !entry.reported[idx] {
                entry.reported[idx] = true;
                entry.count += 1;
            }
            entry.count >= limit
        }
        None => {
            let mut entry = OutstandingInterval {
                interval_ts: ts,
                reported: vec![false; limit],
                count: 0,
            };
            let idx = usize::from(sender);
            if idx < entry.reported.len() {
                entry.reported[idx] = true;
                entry.count = 1;
            }
            let done = entry.count >= limit;
            outstanding.push_back(entry);
            done
        }
    };

    if !completed {
        return None;
    }

    while let Some(front) = outstanding.pop_front() {
        if front.interval_ts == ts {
            break;
        }
        warn!(
            tracker = tracker_id,
            pruned = front.interval_ts,
            completed = ts,
            "pruning incomplete earlier interval, its packets were lost"
        );
    }
    Some(ts)
}
