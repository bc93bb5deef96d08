//! Observation trace replay.
//!
//! A trace file is a stream of pre-tagged packet descriptors, written by
//! an upstream tagger or by [`TraceWriter`]. Replay feeds the engine and
//! derives interval boundaries from descriptor timestamps instead of the
//! wall clock, so a capture replays deterministically at full speed.
//!
//! File layout (all fields little-endian):
//!
//! ```text
//! magic   "DSRP"  4 bytes
//! version u16     currently 1
//! _pad    u16
//! records         56 bytes each, see RECORD_LEN
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::clock::TraceClock;
use crate::observation::{GeoTags, PacketObservation};
use crate::report::ReportEngine;

const MAGIC: &[u8; 4] = b"DSRP";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 8;
const RECORD_LEN: usize = 56;

fn encode_record(obs: &PacketObservation) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..4].copy_from_slice(&obs.ts.to_le_bytes());
    buf[4..8].copy_from_slice(&obs.src_ip.to_le_bytes());
    buf[8..12].copy_from_slice(&obs.dst_ip.to_le_bytes());
    buf[12..16].copy_from_slice(&obs.src_asn.to_le_bytes());
    buf[16..18].copy_from_slice(&obs.ip_bytes.to_le_bytes());
    buf[18] = obs.protocol;
    // buf[19] is padding.
    buf[20..22].copy_from_slice(&obs.src_port.to_le_bytes());
    buf[22..24].copy_from_slice(&obs.dst_port.to_le_bytes());
    buf[24..28].copy_from_slice(&obs.provider_mask.to_le_bytes());
    buf[28..30].copy_from_slice(&obs.geo.maxmind_continent.to_le_bytes());
    buf[30..32].copy_from_slice(&obs.geo.maxmind_country.to_le_bytes());
    buf[32..34].copy_from_slice(&obs.geo.netacq_continent.to_le_bytes());
    buf[34..36].copy_from_slice(&obs.geo.netacq_country.to_le_bytes());
    buf[36..40].copy_from_slice(&obs.geo.netacq_region.to_le_bytes());
    buf[40..44].copy_from_slice(&obs.geo.netacq_polygon.to_le_bytes());
    buf[44..46].copy_from_slice(&obs.geo.ipinfo_continent.to_le_bytes());
    buf[46..48].copy_from_slice(&obs.geo.ipinfo_country.to_le_bytes());
    buf[48..52].copy_from_slice(&obs.geo.ipinfo_region.to_le_bytes());
    buf[52..56].copy_from_slice(&obs.filter_bits.to_le_bytes());
    buf
}

fn decode_record(buf: &[u8; RECORD_LEN]) -> PacketObservation {
    let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
    let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

    PacketObservation {
        ts: u32_at(0),
        src_ip: u32_at(4),
        dst_ip: u32_at(8),
        src_asn: u32_at(12),
        ip_bytes: u16_at(16),
        protocol: buf[18],
        src_port: u16_at(20),
        dst_port: u16_at(22),
        provider_mask: u32_at(24),
        geo: GeoTags {
            maxmind_continent: u16_at(28),
            maxmind_country: u16_at(30),
            netacq_continent: u16_at(32),
            netacq_country: u16_at(34),
            netacq_region: u32_at(36),
            netacq_polygon: u32_at(40),
            ipinfo_continent: u16_at(44),
            ipinfo_country: u16_at(46),
            ipinfo_region: u32_at(48),
        },
        filter_bits: u32_at(52),
    }
}

/// Streams observations out of a trace file.
#[derive(Debug)]
pub struct TraceReader {
    reader: BufReader<File>,
}

impl TraceReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening trace file {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut header)
            .with_context(|| format!("reading trace header from {}", path.display()))?;
        if &header[0..4] != MAGIC {
            bail!("{} is not a darkscope trace file", path.display());
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            bail!(
                "unsupported trace version {version} in {} (expected {VERSION})",
                path.display()
            );
        }

        Ok(TraceReader { reader })
    }

    /// Reads the next observation; `None` at a clean end of file. A
    /// partially-written trailing record is an error, not an EOF.
    pub fn next_observation(&mut self) -> Result<Option<PacketObservation>> {
        let mut buf = [0u8; RECORD_LEN];
        let mut filled = 0;
        while filled < RECORD_LEN {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .context("reading trace record")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!("truncated trace record: got {filled} of {RECORD_LEN} bytes");
            }
            filled += n;
        }
        Ok(Some(decode_record(&buf)))
    }
}

/// Writes observation traces; used by tests and capture tooling.
pub struct TraceWriter {
    writer: BufWriter<File>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating trace file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC).context("writing trace magic")?;
        writer
            .write_all(&VERSION.to_le_bytes())
            .context("writing trace version")?;
        writer.write_all(&[0u8; 2]).context("writing trace header")?;

        Ok(TraceWriter { writer })
    }

    pub fn write_observation(&mut self, obs: &PacketObservation) -> Result<()> {
        self.writer
            .write_all(&encode_record(obs))
            .context("writing trace record")
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().context("flushing trace file")
    }
}

/// Counters reported after a replay run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub packets: u64,
    pub intervals: u64,
}

/// Replays a trace into a running engine, ending intervals at the
/// boundaries the descriptor timestamps cross. The final partial
/// interval is ended at end of stream.
pub fn replay_file(path: &Path, engine: &ReportEngine) -> Result<ReplayStats> {
    let mut reader = TraceReader::open(path)?;
    let mut clock = TraceClock::new(engine.options().interval);
    let mut stats = ReplayStats::default();

    let shards: Vec<_> = (0..engine.shard_count())
        .map(|i| engine.input(i))
        .collect();

    info!(trace = %path.display(), "replaying trace");

    while let Some(obs) = reader.next_observation()? {
        for ended in clock.advance(obs.ts) {
            debug!(interval = ended, "trace clock interval boundary");
            engine.end_interval(ended);
            stats.intervals += 1;
        }

        // Shard by source address so a flow stays on one processor.
        let shard = (obs.src_ip >> 24) as usize % shards.len();
        shards[shard].observe(obs)?;
        stats.packets += 1;
    }

    if let Some(last) = clock.finish() {
        engine.end_interval(last);
        stats.intervals += 1;
    }

    info!(
        packets = stats.packets,
        intervals = stats.intervals,
        "trace replay complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{IPPROTO_TCP, PROVIDER_BASIC, PROVIDER_MAXMIND};

    fn sample_obs(ts: u32) -> PacketObservation {
        PacketObservation {
            src_asn: 64496,
            protocol: IPPROTO_TCP,
            src_port: 22,
            dst_port: 80,
            provider_mask: PROVIDER_BASIC | PROVIDER_MAXMIND,
            geo: GeoTags {
                maxmind_continent: 0x434F,
                maxmind_country: 0x5A4E,
                netacq_region: 77,
                netacq_polygon: 4242,
                ..GeoTags::default()
            },
            filter_bits: 0b10,
            ..PacketObservation::bare(ts, 0x0102_0304, 0x0506_0708, 40)
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let obs = sample_obs(1234);
        let decoded = decode_record(&encode_record(&obs));
        assert_eq!(decoded, obs);
    }

    #[test]
    fn test_trace_file_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("sample.trace");

        let mut writer = TraceWriter::create(&path).expect("create trace");
        for ts in [100, 101, 102] {
            writer.write_observation(&sample_obs(ts)).expect("write");
        }
        writer.finish().expect("finish");

        let mut reader = TraceReader::open(&path).expect("open trace");
        let mut seen = Vec::new();
        while let Some(obs) = reader.next_observation().expect("read") {
            seen.push(obs.ts);
        }
        assert_eq!(seen, vec![100, 101, 102]);
    }

    #[test]
    fn test_reader_rejects_bad_magic() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bogus.trace");
        std::fs::write(&path, b"NOPE0000").expect("write");

        let err = TraceReader::open(&path).unwrap_err();
        assert!(err.to_string().contains("not a darkscope trace"));
    }

    #[test]
    fn test_reader_rejects_bad_version() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("future.trace");
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&99u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 2]);
        std::fs::write(&path, &data).expect("write");

        let err = TraceReader::open(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported trace version"));
    }

    #[test]
    fn test_reader_detects_truncated_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("cut.trace");

        let mut writer = TraceWriter::create(&path).expect("create trace");
        writer.write_observation(&sample_obs(100)).expect("write");
        writer.finish().expect("finish");

        // Chop the final record in half.
        let data = std::fs::read(&path).expect("read");
        std::fs::write(&path, &data[..data.len() - 10]).expect("rewrite");

        let mut reader = TraceReader::open(&path).expect("open trace");
        let err = reader.next_observation().unwrap_err();
        assert!(err.to_string().contains("truncated trace record"));
    }
}
