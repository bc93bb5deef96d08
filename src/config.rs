use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::tag::{pack_geo_code, ClassMask, MetricClass};

/// Hard cap on tracker workers; the partition function assumes it.
pub const MAX_TRACKERS: usize = 32;

/// Top-level configuration for the darkscope engine.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error); the
    /// `--log-level` CLI flag takes precedence. Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Report core configuration.
    #[serde(default)]
    pub report: ReportConfig,

    /// Result sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Report core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Number of IP tracker workers (1..=32). Default: 4.
    #[serde(default = "default_tracker_count")]
    pub tracker_count: usize,

    /// Number of packet-processing workers. Default: 2.
    #[serde(default = "default_processor_count")]
    pub processor_count: usize,

    /// Aggregation interval length. Default: 60s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Label attached to every output row. Default: "unlabeled".
    #[serde(default = "default_row_label")]
    pub output_row_label: String,

    /// Metric class groups to track; empty means all.
    #[serde(default)]
    pub limit_metrics: Vec<String>,

    /// TCP source port ranges to report per-port series for ("80", "0-1024").
    /// Unset means all ports.
    #[serde(default)]
    pub tcp_source_port_range: Vec<String>,

    /// TCP destination port ranges. Unset means all ports.
    #[serde(default)]
    pub tcp_dest_port_range: Vec<String>,

    /// UDP source port ranges. Unset means all ports.
    #[serde(default)]
    pub udp_source_port_range: Vec<String>,

    /// UDP destination port ranges. Unset means all ports.
    #[serde(default)]
    pub udp_dest_port_range: Vec<String>,

    /// Geo series detail: "full" or "lite" (continents + countries only).
    #[serde(default = "default_geo_mode")]
    pub geo_mode: String,

    /// How unique source IPs are counted.
    #[serde(default)]
    pub source_ip_counting: IpCountingConfig,

    /// How unique destination IPs are counted.
    #[serde(default)]
    pub dest_ip_counting: IpCountingConfig,

    /// High-water mark per processor/tracker inbox pair. Default: 30.
    #[serde(default = "default_internal_hwm")]
    pub internal_hwm: usize,

    /// IP updates per tracker message before a flush. Default: 10000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on pending-batch staleness. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Ask the tagger for fully-qualified metric labels. Default: true.
    #[serde(default = "default_true")]
    pub query_tagger_labels: bool,

    /// File of "CC ASN" lines allowing geo x ASN couplet tags.
    #[serde(default)]
    pub geoasn_whitelist_file: Option<PathBuf>,
}

/// Unique-IP counting methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpCountMethod {
    /// Exact hash-set of every observed address.
    All,
    /// Collapse addresses into their /prefix_bits prefix.
    PrefixAgg,
    /// Count one representative per /prefix_bits (first observed).
    Sample,
}

/// Per-direction unique-IP counting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IpCountingConfig {
    /// "all", "prefixagg" or "sample". Default: "all".
    #[serde(default = "default_ip_method")]
    pub method: String,

    /// Prefix length for prefixagg/sample (1..=32). Default: 32.
    #[serde(default = "default_prefix_bits")]
    pub prefix_bits: u8,
}

/// Result sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Output path for JSON-lines results; "-" writes to stdout.
    #[serde(default = "default_sink_path")]
    pub path: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tracker_count() -> usize {
    4
}

fn default_processor_count() -> usize {
    2
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_row_label() -> String {
    "unlabeled".to_string()
}

fn default_geo_mode() -> String {
    "full".to_string()
}

fn default_internal_hwm() -> usize {
    30
}

fn default_batch_size() -> usize {
    10_000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_ip_method() -> String {
    "all".to_string()
}

fn default_prefix_bits() -> u8 {
    32
}

fn default_sink_path() -> String {
    "-".to_string()
}

// --- Default trait impls ---

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            tracker_count: default_tracker_count(),
            processor_count: default_processor_count(),
            interval: default_interval(),
            output_row_label: default_row_label(),
            limit_metrics: Vec::new(),
            tcp_source_port_range: Vec::new(),
            tcp_dest_port_range: Vec::new(),
            udp_source_port_range: Vec::new(),
            udp_dest_port_range: Vec::new(),
            geo_mode: default_geo_mode(),
            source_ip_counting: IpCountingConfig::default(),
            dest_ip_counting: IpCountingConfig::default(),
            internal_hwm: default_internal_hwm(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            query_tagger_labels: true,
            geoasn_whitelist_file: None,
        }
    }
}

impl Default for IpCountingConfig {
    fn default() -> Self {
        Self {
            method: default_ip_method(),
            prefix_bits: default_prefix_bits(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
        }
    }
}

// --- Derived, immutable engine options ---

/// A 65,536-bit port membership bitmap.
#[derive(Clone, PartialEq, Eq)]
pub struct PortBitmap {
    words: Box<[u64; 1024]>,
}

impl PortBitmap {
    /// A bitmap with every port set.
    pub fn full() -> Self {
        PortBitmap {
            words: Box::new([u64::MAX; 1024]),
        }
    }

    /// A bitmap with no ports set.
    pub fn empty() -> Self {
        PortBitmap {
            words: Box::new([0u64; 1024]),
        }
    }

    pub fn set(&mut self, port: u16) {
        let idx = usize::from(port);
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    pub fn set_range(&mut self, first: u16, last: u16) {
        for port in first..=last {
            self.set(port);
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        let idx = usize::from(port);
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Parses a list of "N" / "N-M" range strings into a bitmap.
    /// An empty list yields a full bitmap (all ports reported).
    pub fn from_ranges(ranges: &[String]) -> Result<Self> {
        if ranges.is_empty() {
            return Ok(PortBitmap::full());
        }

        let mut bitmap = PortBitmap::empty();
        for range in ranges {
            let (first, last) = match range.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid port in range '{range}'"))?;
                    let hi: u16 = hi
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid port in range '{range}'"))?;
                    (lo, hi)
                }
                None => {
                    let port: u16 = range
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid port '{range}'"))?;
                    (port, port)
                }
            };
            if last < first {
                bail!("invalid port range '{range}': first port must be <= the last port");
            }
            bitmap.set_range(first, last);
        }
        Ok(bitmap)
    }
}

impl std::fmt::Debug for PortBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        f.debug_struct("PortBitmap").field("ports", &count).finish()
    }
}

/// Geo series detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoMode {
    /// Continents, countries and regions.
    Full,
    /// Continents and countries only.
    Lite,
}

/// Finalized per-direction IP counting behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCounting {
    pub method: IpCountMethod,
    pub prefix_bits: u8,
}

impl IpCounting {
    /// Normalizes an address into its uniqueness key.
    pub fn key(&self, ip: u32) -> u32 {
        match self.method {
            IpCountMethod::All => ip,
            IpCountMethod::PrefixAgg | IpCountMethod::Sample => ip & self.mask(),
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix_bits >= 32 {
            u32::MAX
        } else {
            !(u32::MAX >> self.prefix_bits)
        }
    }
}

/// Immutable options shared by every engine worker, derived from
/// [`ReportConfig`] at startup.
#[derive(Debug)]
pub struct ReportOptions {
    pub tracker_count: usize,
    pub processor_count: usize,
    pub interval: Duration,
    pub label: Arc<str>,
    pub allowed: ClassMask,
    pub tcp_src_ports: PortBitmap,
    pub tcp_dst_ports: PortBitmap,
    pub udp_src_ports: PortBitmap,
    pub udp_dst_ports: PortBitmap,
    pub geo_mode: GeoMode,
    pub src_ip_counting: IpCounting,
    pub dst_ip_counting: IpCounting,
    pub internal_hwm: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub query_tagger_labels: bool,
    /// Allowed geo x ASN pairs, keyed `(country_code << 32) | asn`.
    /// `None` disables couplet classes entirely.
    pub geoasn_whitelist: Option<HashSet<u64>>,
}

impl ReportOptions {
    /// Partition function: which tracker owns an address.
    pub fn tracker_for(&self, ip: u32) -> usize {
        ((ip >> 24) as usize) % self.tracker_count
    }

    pub fn couplet_allowed(&self, country_code: u16, asn: u32) -> bool {
        match &self.geoasn_whitelist {
            Some(set) => set.contains(&((u64::from(country_code) << 32) | u64::from(asn))),
            None => false,
        }
    }
}

fn parse_ip_counting(cfg: &IpCountingConfig, which: &str) -> Result<IpCounting> {
    let method = match cfg.method.to_ascii_lowercase().as_str() {
        "all" | "none" => IpCountMethod::All,
        "prefixagg" => IpCountMethod::PrefixAgg,
        "sample" => IpCountMethod::Sample,
        other => bail!(
            "invalid {which} counting method '{other}', valid values are 'all', 'prefixagg' or 'sample'"
        ),
    };
    if cfg.prefix_bits == 0 || cfg.prefix_bits > 32 {
        bail!("{which} counting prefix_bits must be within 1..=32");
    }
    Ok(IpCounting {
        method,
        prefix_bits: cfg.prefix_bits,
    })
}

fn parse_metric_limits(groups: &[String]) -> Result<ClassMask> {
    if groups.is_empty() {
        return Ok(ClassMask::all());
    }

    let mut mask = ClassMask::none();
    for name in groups {
        match name.to_ascii_lowercase().as_str() {
            "basic" => {
                mask.enable(MetricClass::Combined);
                mask.enable(MetricClass::IpProtocol);
            }
            "tcpports" => {
                mask.enable(MetricClass::TcpSrcPort);
                mask.enable(MetricClass::TcpDstPort);
            }
            "udpports" => {
                mask.enable(MetricClass::UdpSrcPort);
                mask.enable(MetricClass::UdpDstPort);
            }
            "icmp" => {
                mask.enable(MetricClass::IcmpTypeCode);
            }
            "maxmind" => {
                mask.enable(MetricClass::MaxmindContinent);
                mask.enable(MetricClass::MaxmindCountry);
            }
            "netacq" => {
                mask.enable(MetricClass::NetacqContinent);
                mask.enable(MetricClass::NetacqCountry);
                mask.enable(MetricClass::NetacqRegion);
                mask.enable(MetricClass::NetacqPolygon);
            }
            "ipinfo" => {
                mask.enable(MetricClass::IpinfoContinent);
                mask.enable(MetricClass::IpinfoCountry);
                mask.enable(MetricClass::IpinfoRegion);
            }
            "pfx2asn" => {
                mask.enable(MetricClass::PrefixAsn);
                mask.enable(MetricClass::IpinfoCountryAsn);
                mask.enable(MetricClass::IpinfoRegionAsn);
            }
            "filter" => {
                mask.enable(MetricClass::FilterCriteria);
            }
            other => bail!("unknown metric group '{other}' in limit_metrics"),
        }
    }
    Ok(mask)
}

/// Reads a geo-ASN couplet whitelist: one "CC ASN" pair per line,
/// '#' starts a comment.
fn load_geoasn_whitelist(path: &Path) -> Result<HashSet<u64>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading geoasn whitelist {}", path.display()))?;

    let mut set = HashSet::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(cc), Some(asn)) = (parts.next(), parts.next()) else {
            bail!(
                "malformed geoasn whitelist line {} in {}: '{line}'",
                lineno + 1,
                path.display()
            );
        };
        let cc = cc.as_bytes();
        if cc.len() != 2 {
            bail!(
                "malformed country code on geoasn whitelist line {} in {}",
                lineno + 1,
                path.display()
            );
        }
        let asn: u32 = asn.parse().with_context(|| {
            format!(
                "malformed ASN on geoasn whitelist line {} in {}",
                lineno + 1,
                path.display()
            )
        })?;
        let packed = (u64::from(pack_geo_code([cc[0], cc[1]])) << 32) | u64::from(asn);
        set.insert(packed);
    }
    Ok(set)
}

impl ReportConfig {
    /// Validates the configuration and derives the immutable options the
    /// engine workers share. Also logs the effective settings.
    pub fn finalise(&self) -> Result<ReportOptions> {
        if self.tracker_count == 0 || self.tracker_count > MAX_TRACKERS {
            bail!(
                "tracker_count must be within 1..={MAX_TRACKERS}, got {}",
                self.tracker_count
            );
        }
        if self.processor_count == 0 || self.processor_count > 255 {
            bail!(
                "processor_count must be within 1..=255, got {}",
                self.processor_count
            );
        }
        if self.interval < Duration::from_secs(1) {
            bail!("interval must be at least 1 second");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.internal_hwm == 0 {
            bail!("internal_hwm must be positive");
        }

        let mut allowed = parse_metric_limits(&self.limit_metrics)?;

        let geo_mode = match self.geo_mode.to_ascii_lowercase().as_str() {
            "full" => GeoMode::Full,
            "lite" => GeoMode::Lite,
            other => {
                bail!("unexpected geo_mode value '{other}', valid values are 'lite' or 'full'")
            }
        };
        if geo_mode == GeoMode::Lite {
            info!("geo-tagging limited to continents and countries");
            allowed.disable(MetricClass::NetacqRegion);
            allowed.disable(MetricClass::NetacqPolygon);
            allowed.disable(MetricClass::IpinfoRegion);
            allowed.disable(MetricClass::IpinfoRegionAsn);
        }

        let geoasn_whitelist = match &self.geoasn_whitelist_file {
            Some(path) => {
                let set = load_geoasn_whitelist(path)?;
                info!(
                    file = %path.display(),
                    couplets = set.len(),
                    "loaded geoasn couplet whitelist",
                );
                Some(set)
            }
            None => {
                info!("no geoasn couplet whitelist specified, couplet series disabled");
                None
            }
        };

        let src_ip_counting = parse_ip_counting(&self.source_ip_counting, "source_ip")?;
        let dst_ip_counting = parse_ip_counting(&self.dest_ip_counting, "dest_ip")?;

        for (which, counting) in [("source", src_ip_counting), ("dest", dst_ip_counting)] {
            match counting.method {
                IpCountMethod::All => {
                    info!("counting all unique {which} IPs");
                }
                IpCountMethod::PrefixAgg => {
                    info!("aggregating {which} IPs into /{}s", counting.prefix_bits);
                }
                IpCountMethod::Sample => {
                    info!(
                        "counting sampled {which} IPs (1 per /{})",
                        counting.prefix_bits
                    );
                }
            }
        }

        if !self.query_tagger_labels {
            warn!("NOT querying the tagger for fully-qualified metric labels");
        }

        info!(
            label = %self.output_row_label,
            trackers = self.tracker_count,
            processors = self.processor_count,
            interval = ?self.interval,
            hwm = self.internal_hwm,
            all_metrics = allowed.allows_all(),
            "report core configured",
        );

        Ok(ReportOptions {
            tracker_count: self.tracker_count,
            processor_count: self.processor_count,
            interval: self.interval,
            label: Arc::from(self.output_row_label.as_str()),
            allowed,
            tcp_src_ports: PortBitmap::from_ranges(&self.tcp_source_port_range)?,
            tcp_dst_ports: PortBitmap::from_ranges(&self.tcp_dest_port_range)?,
            udp_src_ports: PortBitmap::from_ranges(&self.udp_source_port_range)?,
            udp_dst_ports: PortBitmap::from_ranges(&self.udp_dest_port_range)?,
            geo_mode,
            src_ip_counting,
            dst_ip_counting,
            internal_hwm: self.internal_hwm,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            query_tagger_labels: self.query_tagger_labels,
            geoasn_whitelist,
        })
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_values() {
        let cfg = ReportConfig::default();
        assert_eq!(cfg.tracker_count, 4);
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.internal_hwm, 30);
        assert_eq!(cfg.batch_size, 10_000);
        assert_eq!(cfg.output_row_label, "unlabeled");
        assert!(cfg.query_tagger_labels);
    }

    #[test]
    fn test_finalise_defaults() {
        let opts = ReportConfig::default().finalise().expect("valid defaults");
        assert!(opts.allowed.allows_all());
        assert!(opts.tcp_dst_ports.contains(0));
        assert!(opts.tcp_dst_ports.contains(65535));
        assert_eq!(opts.src_ip_counting.method, IpCountMethod::All);
        assert!(opts.geoasn_whitelist.is_none());
    }

    #[test]
    fn test_tracker_count_bounds() {
        let mut cfg = ReportConfig {
            tracker_count: 0,
            ..Default::default()
        };
        assert!(cfg
            .finalise()
            .unwrap_err()
            .to_string()
            .contains("tracker_count"));

        cfg.tracker_count = 33;
        assert!(cfg
            .finalise()
            .unwrap_err()
            .to_string()
            .contains("tracker_count"));

        cfg.tracker_count = 32;
        assert!(cfg.finalise().is_ok());
    }

    #[test]
    fn test_port_bitmap_ranges() {
        let ranges = vec!["80".to_string(), "443-445".to_string()];
        let bitmap = PortBitmap::from_ranges(&ranges).expect("valid ranges");
        assert!(bitmap.contains(80));
        assert!(bitmap.contains(443));
        assert!(bitmap.contains(445));
        assert!(!bitmap.contains(446));
        assert!(!bitmap.contains(22));
    }

    #[test]
    fn test_port_bitmap_empty_means_all() {
        let bitmap = PortBitmap::from_ranges(&[]).expect("empty is valid");
        assert!(bitmap.contains(0));
        assert!(bitmap.contains(12345));
        assert!(bitmap.contains(65535));
    }

    #[test]
    fn test_port_bitmap_rejects_inverted_range() {
        let ranges = vec!["100-50".to_string()];
        let err = PortBitmap::from_ranges(&ranges).unwrap_err();
        assert!(err.to_string().contains("first port must be <="));
    }

    #[test]
    fn test_geo_mode_lite_disables_regions() {
        let cfg = ReportConfig {
            geo_mode: "lite".to_string(),
            ..Default::default()
        };
        let opts = cfg.finalise().expect("valid config");
        assert!(!opts.allowed.allows(MetricClass::NetacqRegion));
        assert!(!opts.allowed.allows(MetricClass::NetacqPolygon));
        assert!(!opts.allowed.allows(MetricClass::IpinfoRegion));
        assert!(!opts.allowed.allows(MetricClass::IpinfoRegionAsn));
        assert!(opts.allowed.allows(MetricClass::IpinfoCountry));
    }

    #[test]
    fn test_bad_geo_mode_rejected() {
        let cfg = ReportConfig {
            geo_mode: "medium".to_string(),
            ..Default::default()
        };
        assert!(cfg.finalise().unwrap_err().to_string().contains("geo_mode"));
    }

    #[test]
    fn test_limit_metrics_groups() {
        let cfg = ReportConfig {
            limit_metrics: vec!["basic".to_string(), "tcpports".to_string()],
            ..Default::default()
        };
        let opts = cfg.finalise().expect("valid config");
        assert!(opts.allowed.allows(MetricClass::Combined));
        assert!(opts.allowed.allows(MetricClass::TcpDstPort));
        assert!(!opts.allowed.allows(MetricClass::UdpDstPort));
        assert!(!opts.allowed.allows(MetricClass::PrefixAsn));
    }

    #[test]
    fn test_unknown_metric_group_rejected() {
        let cfg = ReportConfig {
            limit_metrics: vec!["bogus".to_string()],
            ..Default::default()
        };
        assert!(cfg.finalise().unwrap_err().to_string().contains("bogus"));
    }

    #[test]
    fn test_ip_counting_normalization() {
        let agg = IpCounting {
            method: IpCountMethod::PrefixAgg,
            prefix_bits: 24,
        };
        assert_eq!(agg.key(0x0102_0304), 0x0102_0300);
        assert_eq!(agg.key(0x0102_03FF), 0x0102_0300);

        let all = IpCounting {
            method: IpCountMethod::All,
            prefix_bits: 24,
        };
        assert_eq!(all.key(0x0102_0304), 0x0102_0304);
    }

    #[test]
    fn test_ip_counting_rejects_bad_bits() {
        let cfg = IpCountingConfig {
            method: "sample".to_string(),
            prefix_bits: 0,
        };
        assert!(parse_ip_counting(&cfg, "source_ip").is_err());

        let cfg = IpCountingConfig {
            method: "sample".to_string(),
            prefix_bits: 33,
        };
        assert!(parse_ip_counting(&cfg, "source_ip").is_err());
    }

    #[test]
    fn test_geoasn_whitelist_parsing() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# comment").expect("write");
        writeln!(file, "NZ 64496").expect("write");
        writeln!(file, "AU 64497  # trailing comment").expect("write");
        writeln!(file).expect("write");

        let cfg = ReportConfig {
            geoasn_whitelist_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let opts = cfg.finalise().expect("valid config");
        assert!(opts.couplet_allowed(pack_geo_code(*b"NZ"), 64496));
        assert!(opts.couplet_allowed(pack_geo_code(*b"AU"), 64497));
        assert!(!opts.couplet_allowed(pack_geo_code(*b"NZ"), 64497));
    }

    #[test]
    fn test_geoasn_whitelist_missing_file() {
        let cfg = ReportConfig {
            geoasn_whitelist_file: Some(PathBuf::from("/nonexistent/whitelist")),
            ..Default::default()
        };
        let err = cfg.finalise().unwrap_err();
        assert!(err.to_string().contains("geoasn whitelist"));
    }

    #[test]
    fn test_geoasn_whitelist_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "NZL 64496").expect("write");

        let cfg = ReportConfig {
            geoasn_whitelist_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(cfg.finalise().is_err());
    }

    #[test]
    fn test_tracker_partition_is_stable() {
        let opts = ReportConfig::default().finalise().expect("valid defaults");
        let ip = 0x0A00_0001u32; // 10.0.0.1
        assert_eq!(opts.tracker_for(ip), 0x0A % 4);
        assert_eq!(opts.tracker_for(ip), opts.tracker_for(ip));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
log_level: debug
report:
  tracker_count: 2
  processor_count: 1
  interval: 60s
  output_row_label: telescope-a
  tcp_dest_port_range:
    - "80"
    - "443"
  source_ip_counting:
    method: sample
    prefix_bits: 24
sink:
  path: /tmp/out.jsonl
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.report.tracker_count, 2);
        assert_eq!(cfg.report.output_row_label, "telescope-a");
        assert_eq!(cfg.report.source_ip_counting.method, "sample");
        assert_eq!(cfg.sink.path, "/tmp/out.jsonl");

        let opts = cfg.report.finalise().expect("valid config");
        assert!(opts.tcp_dst_ports.contains(80));
        assert!(!opts.tcp_dst_ports.contains(22));
        assert_eq!(opts.src_ip_counting.method, IpCountMethod::Sample);
        assert_eq!(opts.src_ip_counting.prefix_bits, 24);
    }
}
