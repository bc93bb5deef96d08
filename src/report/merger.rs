//! The merge worker.
//!
//! For every ended interval the merger polls each tracker's result slot
//! with a non-blocking try-lock until all trackers have either published
//! that interval or halted. Tallies sum directly: addresses are
//! partitioned across trackers so unique IP counts never overlap. Unique
//! ASN counts are approximate under partitioning (the same ASN can appear
//! behind several trackers); this is a documented property of the design.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::config::ReportOptions;
use crate::report::sink::{IntervalResult, ResultRow, ResultSink};
use crate::report::tally::MetricTally;
use crate::report::tracker::{HaltPhase, TrackerShared};
use crate::tag::TagKey;

/// How long the merger sleeps when some tracker is not ready yet.
const MERGE_BACKOFF: Duration = Duration::from_micros(200);

/// Commands driving the merge worker.
#[derive(Debug)]
pub enum MergerInput {
    /// The interval starting at the carried timestamp has ended.
    IntervalEnd(u32),
    Halt,
}

#[derive(Default)]
struct MergedTally {
    packets: u64,
    bytes: u64,
    src_ips: u32,
    dst_ips: u32,
    src_asns: u32,
    associated: Vec<TagKey>,
}

/// The merge worker.
pub struct Merger {
    input: Receiver<MergerInput>,
    trackers: Vec<Arc<TrackerShared>>,
    opts: Arc<ReportOptions>,
    sink: Box<dyn ResultSink>,
}

impl Merger {
    pub fn new(
        input: Receiver<MergerInput>,
        trackers: Vec<Arc<TrackerShared>>,
        opts: Arc<ReportOptions>,
        sink: Box<dyn ResultSink>,
    ) -> Self {
        Merger {
            input,
            trackers,
            opts,
            sink,
        }
    }

    /// Worker loop; exits on HALT or when the input channel closes.
    pub fn run(mut self) {
        while let Ok(input) = self.input.recv() {
            match input {
                MergerInput::IntervalEnd(ts) => self.merge_interval(ts),
                MergerInput::Halt => break,
            }
        }

        if let Err(e) = self.sink.close() {
            error!(sink = self.sink.name(), error = %e, "closing result sink failed");
        }
        info!("merger exiting");
    }

    /// Waits for every tracker to finalize `ts`, then sums and emits.
    fn merge_interval(&mut self, ts: u32) {
        debug!(interval = ts, "waiting for tracker results");

        let tracker_count = self.trackers.len();
        let mut done = vec![false; tracker_count];
        let mut total_done = 0;
        let mut incomplete = false;
        let mut lost_messages = 0u64;
        let mut merged: HashMap<TagKey, MergedTally> = HashMap::new();

        while total_done < tracker_count {
            for (i, shared) in self.trackers.iter().enumerate() {
                if done[i] {
                    continue;
                }

                // A busy tracker just gets skipped this round.
                let Some(mut slot) = shared.slot.try_lock() else {
                    continue;
                };

                if slot.last_ts == ts && slot.last_result.is_some() {
                    let tallies = slot.last_result.take().expect("checked above");
                    lost_messages += std::mem::take(&mut slot.lost_messages);
                    drop(slot);

                    accumulate(&mut merged, tallies);
                    done[i] = true;
                    total_done += 1;
                } else if slot.halt_phase == HaltPhase::Halted {
                    // Halted mid-interval; this result would undercount.
                    done[i] = true;
                    total_done += 1;
                    incomplete = true;
                } else if slot.last_ts > ts {
                    // The tracker has moved past us; the tally is gone.
                    warn!(
                        tracker = i,
                        interval = ts,
                        tracker_ts = slot.last_ts,
                        "tracker advanced past interval before merge"
                    );
                    done[i] = true;
                    total_done += 1;
                    incomplete = true;
                }
            }

            if total_done < tracker_count {
                std::thread::sleep(MERGE_BACKOFF);
            }
        }

        if incomplete {
            warn!(
                interval = ts,
                "not all trackers produced this interval, suppressing result"
            );
            return;
        }

        let result = self.build_result(ts, lost_messages, merged);
        debug!(
            interval = ts,
            rows = result.rows.len(),
            lost = result.lost_messages,
            "interval merged"
        );

        if let Err(e) = self.sink.emit(&result) {
            error!(
                sink = self.sink.name(),
                interval = ts,
                error = %e,
                "result emission failed"
            );
        }
    }

    fn build_result(
        &self,
        ts: u32,
        lost_messages: u64,
        merged: HashMap<TagKey, MergedTally>,
    ) -> IntervalResult {
        let timestamp = ResultRow::format_ts(ts);

        let mut entries: Vec<(TagKey, MergedTally)> = merged.into_iter().collect();
        // Deterministic output ordering: identical inputs give
        // byte-identical results.
        entries.sort_by_key(|(tag, _)| *tag);

        let rows = entries
            .into_iter()
            .map(|(tag, tally)| ResultRow {
                interval_ts: ts,
                timestamp: timestamp.clone(),
                label: self.opts.label.to_string(),
                metric_class: tag.class.as_str(),
                metric_value: tag.format_value(),
                src_ip_count: tally.src_ips,
                dst_ip_count: tally.dst_ips,
                src_asn_count: tally.src_asns,
                packet_count: tally.packets,
                byte_count: tally.bytes,
                associated: tally
                    .associated
                    .iter()
                    .map(ResultRow::format_associated)
                    .collect(),
            })
            .collect();

        IntervalResult {
            interval_ts: ts,
            lost_messages,
            rows,
        }
    }
}

fn accumulate(merged: &mut HashMap<TagKey, MergedTally>, tallies: HashMap<TagKey, MetricTally>) {
    for (tag, tally) in tallies {
        let entry = merged.entry(tag).or_default();
        entry.packets += tally.packets;
        entry.bytes += tally.bytes;
        entry.src_ips += tally.unique_src_ips;
        entry.dst_ips += tally.unique_dst_ips;
        entry.src_asns += tally.src_asns.len() as u32;
        for assoc in tally.associated {
            if !entry.associated.contains(&assoc) {
                entry.associated.push(assoc);
            }
        }
    }
}
