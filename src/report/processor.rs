//! Packet-processing workers.
//!
//! Each processor consumes tagged packet descriptors from its input
//! shard, expands the tag set every metric class contributes for that
//! packet, and appends per-IP updates to a pending batch for the tracker
//! that owns each address. Batches flush on a size threshold, on the
//! flush cadence, and at interval boundaries.

use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::config::{GeoMode, ReportOptions};
use crate::observation::{
    PacketObservation, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, PROVIDER_BASIC, PROVIDER_IPINFO,
    PROVIDER_MAXMIND, PROVIDER_NETACQ, PROVIDER_PFX2ASN,
};
use crate::report::message::{
    encode_control, encode_update, IpUpdate, Role, TagUpdate, MSG_HALT, MSG_INTERVAL, MSG_RESET,
};
use crate::report::transport::InboxSender;
use crate::tag::{MetricClass, TagKey};

/// Commands delivered to a processor's input shard.
#[derive(Debug)]
pub enum ProcessorInput {
    Observe(PacketObservation),
    /// The interval starting at the carried timestamp has ended.
    IntervalEnd(u32),
    Reset,
    Halt,
}

/// Expands the full tag set for one observation.
///
/// The implicit combined tag always comes first; everything else depends
/// on the providers present, the class allow mask, the port bitmaps and
/// the couplet whitelist.
pub fn expand_tags(obs: &PacketObservation, opts: &ReportOptions, tags: &mut Vec<TagKey>) {
    tags.clear();
    tags.push(TagKey::combined());

    if !obs.has_provider(PROVIDER_BASIC) {
        return;
    }

    if opts.allowed.allows(MetricClass::IpProtocol) {
        tags.push(TagKey::scalar(
            MetricClass::IpProtocol,
            u32::from(obs.protocol),
        ));
    }

    match obs.protocol {
        IPPROTO_ICMP => {
            if opts.allowed.allows(MetricClass::IcmpTypeCode) {
                // For ICMP the tagger stores type and code in the port fields.
                let typecode = (u32::from(obs.src_port & 0xFF) << 8) | u32::from(obs.dst_port & 0xFF);
                tags.push(TagKey::scalar(MetricClass::IcmpTypeCode, typecode));
            }
        }
        IPPROTO_TCP => {
            if opts.allowed.allows(MetricClass::TcpSrcPort) && opts.tcp_src_ports.contains(obs.src_port)
            {
                tags.push(TagKey::scalar(
                    MetricClass::TcpSrcPort,
                    u32::from(obs.src_port),
                ));
            }
            if opts.allowed.allows(MetricClass::TcpDstPort) && opts.tcp_dst_ports.contains(obs.dst_port)
            {
                tags.push(TagKey::scalar(
                    MetricClass::TcpDstPort,
                    u32::from(obs.dst_port),
                ));
            }
        }
        IPPROTO_UDP => {
            if opts.allowed.allows(MetricClass::UdpSrcPort) && opts.udp_src_ports.contains(obs.src_port)
            {
                tags.push(TagKey::scalar(
                    MetricClass::UdpSrcPort,
                    u32::from(obs.src_port),
                ));
            }
            if opts.allowed.allows(MetricClass::UdpDstPort) && opts.udp_dst_ports.contains(obs.dst_port)
            {
                tags.push(TagKey::scalar(
                    MetricClass::UdpDstPort,
                    u32::from(obs.dst_port),
                ));
            }
        }
        _ => {}
    }

    if obs.has_provider(PROVIDER_MAXMIND) {
        if opts.allowed.allows(MetricClass::MaxmindContinent) {
            tags.push(TagKey::scalar(
                MetricClass::MaxmindContinent,
                u32::from(obs.geo.maxmind_continent),
            ));
        }
        if opts.allowed.allows(MetricClass::MaxmindCountry) {
            tags.push(TagKey::scalar(
                MetricClass::MaxmindCountry,
                u32::from(obs.geo.maxmind_country),
            ));
        }
    }

    if obs.has_provider(PROVIDER_NETACQ) {
        if opts.allowed.allows(MetricClass::NetacqContinent) {
            tags.push(TagKey::scalar(
                MetricClass::NetacqContinent,
                u32::from(obs.geo.netacq_continent),
            ));
        }
        if opts.allowed.allows(MetricClass::NetacqCountry) {
            tags.push(TagKey::scalar(
                MetricClass::NetacqCountry,
                u32::from(obs.geo.netacq_country),
            ));
        }
        if opts.geo_mode == GeoMode::Full && opts.allowed.allows(MetricClass::NetacqRegion) {
            tags.push(TagKey::scalar(
                MetricClass::NetacqRegion,
                obs.geo.netacq_region,
            ));
        }
        if opts.geo_mode == GeoMode::Full && opts.allowed.allows(MetricClass::NetacqPolygon) {
            tags.push(TagKey::scalar(
                MetricClass::NetacqPolygon,
                obs.geo.netacq_polygon,
            ));
        }
    }

    if obs.has_provider(PROVIDER_IPINFO) {
        if opts.allowed.allows(MetricClass::IpinfoContinent) {
            tags.push(TagKey::scalar(
                MetricClass::IpinfoContinent,
                u32::from(obs.geo.ipinfo_continent),
            ));
        }
        if opts.allowed.allows(MetricClass::IpinfoCountry) {
            tags.push(TagKey::scalar(
                MetricClass::IpinfoCountry,
                u32::from(obs.geo.ipinfo_country),
            ));
        }
        if opts.geo_mode == GeoMode::Full && opts.allowed.allows(MetricClass::IpinfoRegion) {
            tags.push(TagKey::scalar(
                MetricClass::IpinfoRegion,
                obs.geo.ipinfo_region,
            ));
        }
    }

    if obs.has_provider(PROVIDER_PFX2ASN) {
        if opts.allowed.allows(MetricClass::PrefixAsn) {
            tags.push(TagKey::scalar(MetricClass::PrefixAsn, obs.src_asn));
        }

        if obs.has_provider(PROVIDER_IPINFO)
            && opts.couplet_allowed(obs.geo.ipinfo_country, obs.src_asn)
        {
            if opts.allowed.allows(MetricClass::IpinfoCountryAsn) {
                tags.push(TagKey::couplet(
                    MetricClass::IpinfoCountryAsn,
                    u32::from(obs.geo.ipinfo_country),
                    obs.src_asn,
                ));
            }
            if opts.geo_mode == GeoMode::Full && opts.allowed.allows(MetricClass::IpinfoRegionAsn) {
                tags.push(TagKey::couplet(
                    MetricClass::IpinfoRegionAsn,
                    obs.geo.ipinfo_region,
                    obs.src_asn,
                ));
            }
        }
    }

    if obs.filter_bits != 0 && opts.allowed.allows(MetricClass::FilterCriteria) {
        for bit in 0..32 {
            if obs.filter_bits & (1 << bit) != 0 {
                tags.push(TagKey::scalar(MetricClass::FilterCriteria, bit));
            }
        }
    }
}

/// One packet-processing worker.
pub struct Processor {
    id: u8,
    opts: Arc<ReportOptions>,
    input: Receiver<ProcessorInput>,
    trackers: Vec<InboxSender>,
    /// Pending per-tracker update batches.
    pending: Vec<Vec<IpUpdate>>,
    /// Next sequence number per tracker inbox.
    seqnos: Vec<u32>,
    /// Scratch tag buffer reused across packets.
    tag_scratch: Vec<TagKey>,
}

impl Processor {
    pub fn new(
        id: u8,
        opts: Arc<ReportOptions>,
        input: Receiver<ProcessorInput>,
        trackers: Vec<InboxSender>,
    ) -> Self {
        let tracker_count = trackers.len();
        Processor {
            id,
            opts,
            input,
            trackers,
            pending: (0..tracker_count).map(|_| Vec::new()).collect(),
            seqnos: vec![0; tracker_count],
            tag_scratch: Vec::with_capacity(32),
        }
    }

    /// Worker loop; runs until HALT or the input shard is closed.
    pub fn run(mut self) {
        loop {
            match self.input.recv_timeout(self.opts.flush_interval) {
                Ok(ProcessorInput::Observe(obs)) => {
                    self.handle_observation(&obs);
                }
                Ok(ProcessorInput::IntervalEnd(ts)) => {
                    self.flush_all();
                    self.broadcast(MSG_INTERVAL, ts);
                }
                Ok(ProcessorInput::Reset) => {
                    for batch in &mut self.pending {
                        batch.clear();
                    }
                    self.broadcast(MSG_RESET, 0);
                }
                Ok(ProcessorInput::Halt) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush_all();
                    self.broadcast(MSG_HALT, 0);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Flush cadence: bound the staleness of pending batches.
                    self.flush_all();
                }
            }
        }
        debug!(processor = self.id, "processor exiting");
    }

    fn handle_observation(&mut self, obs: &PacketObservation) {
        let mut tags = std::mem::take(&mut self.tag_scratch);
        expand_tags(obs, &self.opts, &mut tags);

        self.append_update(obs.src_ip, obs, Role::Src, &tags);
        self.append_update(obs.dst_ip, obs, Role::Dst, &tags);

        self.tag_scratch = tags;
    }

    fn append_update(&mut self, addr: u32, obs: &PacketObservation, role: Role, tags: &[TagKey]) {
        let tracker = self.opts.tracker_for(addr);

        // Packets and bytes are charged via the source role only.
        let (bytes, packets) = match role {
            Role::Src => (u32::from(obs.ip_bytes), 1),
            Role::Dst => (0, 0),
        };

        self.pending[tracker].push(IpUpdate {
            ip: addr,
            src_asn: obs.src_asn,
            role,
            bytes,
            packets,
            tags: tags
                .iter()
                .map(|&tag| TagUpdate {
                    tag,
                    bytes: u64::from(bytes),
                    packets,
                })
                .collect(),
        });

        if self.pending[tracker].len() >= self.opts.batch_size {
            self.flush(tracker);
        }
    }

    fn flush(&mut self, tracker: usize) {
        if self.pending[tracker].is_empty() {
            return;
        }
        let updates = std::mem::take(&mut self.pending[tracker]);
        let frame = encode_update(self.id, self.seqnos[tracker], &updates);
        self.seqnos[tracker] = self.seqnos[tracker].wrapping_add(1);

        if self.trackers[tracker].send(frame).is_err() {
            warn!(
                processor = self.id,
                tracker, "tracker inbox closed, dropping update batch"
            );
        }
    }

    fn flush_all(&mut self) {
        for tracker in 0..self.trackers.len() {
            self.flush(tracker);
        }
    }

    fn broadcast(&mut self, msg_type: u8, timestamp: u32) {
        for tracker in 0..self.trackers.len() {
            let frame = encode_control(msg_type, self.id, self.seqnos[tracker], timestamp);
            self.seqnos[tracker] = self.seqnos[tracker].wrapping_add(1);
            if self.trackers[tracker].send(frame).is_err() {
                warn!(
                    processor = self.id,
                    tracker, msg_type, "tracker inbox closed, dropping control frame"
                );
            }
        }
    }
}
