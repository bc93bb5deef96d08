//! The report core: a parallel aggregation engine for tagged packets.
//!
//! Topology: N processors expand and batch per-packet tag updates,
//! partition them by address to M trackers over bounded inboxes, and the
//! merger combines finalized per-tracker tallies into one result set per
//! interval. A control layer drives interval boundaries and shutdown.
//!
//! ```text
//! tagger -> Processor (xN) -> inbox -> Tracker (xM) -> result slot -> Merger -> sink
//! ```

pub mod merger;
pub mod message;
pub mod processor;
pub mod sink;
pub mod tally;
pub mod tracker;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::clock::TraceClock;
use crate::config::ReportOptions;
use crate::observation::PacketObservation;

use self::merger::{Merger, MergerInput};
use self::processor::{Processor, ProcessorInput};
use self::sink::ResultSink;
use self::tracker::{Tracker, TrackerShared};
use self::transport::tracker_inboxes;

/// Capacity of each processor's input shard.
const INPUT_SHARD_CAPACITY: usize = 65536;

/// Handle for feeding observations into one processor shard.
#[derive(Clone)]
pub struct ObservationSender {
    inner: Sender<ProcessorInput>,
}

impl ObservationSender {
    /// Blocks while the shard is full. Errors once the engine is down.
    pub fn observe(&self, obs: PacketObservation) -> Result<()> {
        self.inner
            .send(ProcessorInput::Observe(obs))
            .map_err(|_| anyhow::anyhow!("report engine input closed"))
    }
}

/// The running report core: all worker threads plus their control handles.
pub struct ReportEngine {
    opts: Arc<ReportOptions>,
    inputs: Vec<Sender<ProcessorInput>>,
    merger_tx: Sender<MergerInput>,
    processors: Vec<JoinHandle<()>>,
    trackers: Vec<JoinHandle<()>>,
    merger: Option<JoinHandle<()>>,
    ticker_stop: Option<Arc<AtomicBool>>,
    ticker: Option<JoinHandle<()>>,
}

impl ReportEngine {
    /// Spawns trackers, processors and the merger.
    pub fn start(opts: ReportOptions, sink: Box<dyn ResultSink>) -> Result<Self> {
        let opts = Arc::new(opts);

        let (inbox_txs, inbox_rxs) =
            tracker_inboxes(opts.tracker_count, opts.processor_count, opts.internal_hwm);

        let shared: Vec<Arc<TrackerShared>> = (0..opts.tracker_count)
            .map(|_| Arc::new(TrackerShared::new()))
            .collect();

        let mut trackers = Vec::with_capacity(opts.tracker_count);
        for (i, inbox) in inbox_rxs.into_iter().enumerate() {
            let tracker = Tracker::new(i, Arc::clone(&opts), inbox, Arc::clone(&shared[i]));
            let handle = std::thread::Builder::new()
                .name(format!("tracker-{i}"))
                .spawn(move || tracker.run())
                .with_context(|| format!("spawning tracker thread {i}"))?;
            trackers.push(handle);
        }

        let mut inputs = Vec::with_capacity(opts.processor_count);
        let mut processors = Vec::with_capacity(opts.processor_count);
        for i in 0..opts.processor_count {
            let (tx, rx) = crossbeam_channel::bounded(INPUT_SHARD_CAPACITY);
            let processor = Processor::new(i as u8, Arc::clone(&opts), rx, inbox_txs.clone());
            let handle = std::thread::Builder::new()
                .name(format!("processor-{i}"))
                .spawn(move || processor.run())
                .with_context(|| format!("spawning processor thread {i}"))?;
            inputs.push(tx);
            processors.push(handle);
        }

        let (merger_tx, merger_rx) = crossbeam_channel::unbounded();
        let merger = Merger::new(merger_rx, shared, Arc::clone(&opts), sink);
        let merger = std::thread::Builder::new()
            .name("merger".to_string())
            .spawn(move || merger.run())
            .context("spawning merger thread")?;

        info!(
            processors = opts.processor_count,
            trackers = opts.tracker_count,
            "report engine started"
        );

        Ok(ReportEngine {
            opts,
            inputs,
            merger_tx,
            processors,
            trackers,
            merger: Some(merger),
            ticker_stop: None,
            ticker: None,
        })
    }

    pub fn options(&self) -> &ReportOptions {
        &self.opts
    }

    /// The input handle for one processor shard.
    pub fn input(&self, shard: usize) -> ObservationSender {
        ObservationSender {
            inner: self.inputs[shard % self.inputs.len()].clone(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.inputs.len()
    }

    /// Broadcasts the end of the interval starting at `ts`: processors
    /// flush and emit markers, and the merger is told to expect results.
    pub fn end_interval(&self, ts: u32) {
        for input in &self.inputs {
            if input.send(ProcessorInput::IntervalEnd(ts)).is_err() {
                warn!(interval = ts, "processor input closed during interval end");
            }
        }
        if self.merger_tx.send(MergerInput::IntervalEnd(ts)).is_err() {
            warn!(interval = ts, "merger input closed during interval end");
        }
    }

    /// Discards all in-flight aggregation state.
    pub fn reset(&self) {
        for input in &self.inputs {
            if input.send(ProcessorInput::Reset).is_err() {
                warn!("processor input closed during reset");
            }
        }
    }

    /// Starts a control thread that ends intervals on aligned wall-clock
    /// boundaries.
    pub fn start_wall_clock(&mut self) -> Result<()> {
        if self.ticker.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let inputs = self.inputs.clone();
        let merger_tx = self.merger_tx.clone();
        let interval = self.opts.interval;

        let handle = std::thread::Builder::new()
            .name("interval-clock".to_string())
            .spawn(move || {
                let mut clock = TraceClock::new(interval);
                let now = wall_secs();
                clock.advance(now);

                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                    for ended in clock.advance(wall_secs()) {
                        info!(interval = ended, "wall clock interval boundary");
                        for input in &inputs {
                            let _ = input.send(ProcessorInput::IntervalEnd(ended));
                        }
                        let _ = merger_tx.send(MergerInput::IntervalEnd(ended));
                    }
                }
            })
            .context("spawning interval clock thread")?;

        self.ticker_stop = Some(stop);
        self.ticker = Some(handle);
        Ok(())
    }

    /// Drains and joins every worker: processors flush and halt, trackers
    /// finish queued interval ends and exit, then the merger finishes.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.ticker_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                warn!("interval clock thread panicked");
            }
        }

        for input in &self.inputs {
            let _ = input.send(ProcessorInput::Halt);
        }
        for (i, handle) in self.processors.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(processor = i, "processor thread panicked");
            }
        }

        for (i, handle) in self.trackers.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(tracker = i, "tracker thread panicked");
            }
        }

        let _ = self.merger_tx.send(MergerInput::Halt);
        if let Some(merger) = self.merger.take() {
            if merger.join().is_err() {
                warn!("merger thread panicked");
            }
        }

        info!("report engine stopped");
        Ok(())
    }
}

fn wall_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as u32
}
