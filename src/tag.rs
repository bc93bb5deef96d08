//! Metric classes and tag identities.
//!
//! Every statistic tracked by the report engine is keyed by a tag: a
//! metric class (the dimension, e.g. "TCP destination port") plus a
//! class-dependent value. Scalar classes pack their value into the low
//! 32 bits of the tag id; couplet classes need the full 64 bits.

use std::fmt;

/// Metric classes recognized by the report engine.
///
/// Discriminants are stable: they appear in the wire format and in the
/// `limit_metrics` allow mask, so renumbering breaks replay files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MetricClass {
    Combined = 0,
    IpProtocol = 1,
    IcmpTypeCode = 2,
    TcpSrcPort = 3,
    TcpDstPort = 4,
    UdpSrcPort = 5,
    UdpDstPort = 6,
    MaxmindContinent = 7,
    MaxmindCountry = 8,
    NetacqContinent = 9,
    NetacqCountry = 10,
    NetacqRegion = 11,
    IpinfoContinent = 12,
    IpinfoCountry = 13,
    IpinfoRegion = 14,
    PrefixAsn = 15,
    IpinfoCountryAsn = 16,
    IpinfoRegionAsn = 17,
    FilterCriteria = 18,
    NetacqPolygon = 19,
}

impl MetricClass {
    /// Total number of metric classes.
    pub const COUNT: u8 = 20;

    /// Decodes a class from its wire discriminant.
    pub fn from_u8(v: u8) -> Option<Self> {
        use MetricClass::*;
        Some(match v {
            0 => Combined,
            1 => IpProtocol,
            2 => IcmpTypeCode,
            3 => TcpSrcPort,
            4 => TcpDstPort,
            5 => UdpSrcPort,
            6 => UdpDstPort,
            7 => MaxmindContinent,
            8 => MaxmindCountry,
            9 => NetacqContinent,
            10 => NetacqCountry,
            11 => NetacqRegion,
            12 => IpinfoContinent,
            13 => IpinfoCountry,
            14 => IpinfoRegion,
            15 => PrefixAsn,
            16 => IpinfoCountryAsn,
            17 => IpinfoRegionAsn,
            18 => FilterCriteria,
            19 => NetacqPolygon,
            _ => return None,
        })
    }

    /// Returns the class name used in output rows.
    pub fn as_str(self) -> &'static str {
        use MetricClass::*;
        match self {
            Combined => "combined",
            IpProtocol => "ip-protocol",
            IcmpTypeCode => "icmp-typecode",
            TcpSrcPort => "tcp-src-port",
            TcpDstPort => "tcp-dst-port",
            UdpSrcPort => "udp-src-port",
            UdpDstPort => "udp-dst-port",
            MaxmindContinent => "maxmind-continent",
            MaxmindCountry => "maxmind-country",
            NetacqContinent => "netacq-continent",
            NetacqCountry => "netacq-country",
            NetacqRegion => "netacq-region",
            IpinfoContinent => "ipinfo-continent",
            IpinfoCountry => "ipinfo-country",
            IpinfoRegion => "ipinfo-region",
            PrefixAsn => "pfx2asn",
            IpinfoCountryAsn => "ipinfo-country-asn",
            IpinfoRegionAsn => "ipinfo-region-asn",
            FilterCriteria => "filter-criteria",
            NetacqPolygon => "netacq-polygon",
        }
    }

    /// Whether this class packs a two-letter geo code into its value.
    pub fn is_geo_code(self) -> bool {
        use MetricClass::*;
        matches!(
            self,
            MaxmindContinent
                | MaxmindCountry
                | NetacqContinent
                | NetacqCountry
                | IpinfoContinent
                | IpinfoCountry
        )
    }

    /// Whether this class is a geo x ASN couplet.
    pub fn is_couplet(self) -> bool {
        matches!(
            self,
            MetricClass::IpinfoCountryAsn | MetricClass::IpinfoRegionAsn
        )
    }

    /// The classes a couplet is derived from; empty for scalar classes.
    /// Tallies for couplets cross-reference tags of these classes so
    /// consumers can de-aggregate.
    pub fn couplet_components(self) -> &'static [MetricClass] {
        use MetricClass::*;
        match self {
            IpinfoCountryAsn | IpinfoRegionAsn => &[
                IpinfoContinent,
                IpinfoCountry,
                IpinfoRegion,
                PrefixAsn,
            ],
            _ => &[],
        }
    }

    /// The bit this class occupies in a [`ClassMask`].
    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

impl fmt::Display for MetricClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmask of metric classes enabled for a run. Zero means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassMask(u64);

impl ClassMask {
    /// A mask that allows every class.
    pub fn all() -> Self {
        ClassMask(0)
    }

    /// An empty mask builder; call [`ClassMask::enable`] to add classes.
    pub fn none() -> Self {
        // Non-zero sentinel with no class bits set; distinct from the
        // zero value, which means "all classes allowed".
        ClassMask(1u64 << 63)
    }

    pub fn enable(&mut self, class: MetricClass) {
        self.0 |= class.bit();
    }

    pub fn disable(&mut self, class: MetricClass) {
        if self.0 == 0 {
            // Expand the "all" shorthand so a single class can be removed.
            for c in 0..MetricClass::COUNT {
                self.0 |= 1u64 << c;
            }
            self.0 |= 1u64 << 63;
        }
        self.0 &= !class.bit();
    }

    pub fn allows(&self, class: MetricClass) -> bool {
        self.0 == 0 || (self.0 & class.bit()) != 0
    }

    /// Whether the mask still carries the "all classes" shorthand.
    pub fn allows_all(&self) -> bool {
        self.0 == 0
    }
}

/// A tag identity: metric class plus 64-bit value id.
///
/// For scalar classes the id follows the `(class << 32) | value` layout
/// used on the wire; couplet classes use the full 64 bits for the packed
/// pair, with the class byte carried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagKey {
    pub class: MetricClass,
    pub id: u64,
}

impl TagKey {
    /// Builds a tag for a scalar-valued class.
    pub fn scalar(class: MetricClass, value: u32) -> Self {
        TagKey {
            class,
            id: ((class as u64) << 32) | u64::from(value),
        }
    }

    /// Builds a couplet tag from a geo value and an ASN.
    pub fn couplet(class: MetricClass, geo: u32, asn: u32) -> Self {
        TagKey {
            class,
            id: (u64::from(geo) << 32) | u64::from(asn),
        }
    }

    /// The implicit tag every packet carries.
    pub fn combined() -> Self {
        TagKey::scalar(MetricClass::Combined, 0)
    }

    /// The scalar value for non-couplet classes.
    pub fn value(&self) -> u32 {
        (self.id & 0xFFFF_FFFF) as u32
    }

    /// Renders the value the way output rows expect it.
    pub fn format_value(&self) -> String {
        if self.class == MetricClass::Combined {
            return "all".to_string();
        }
        if self.class.is_geo_code() {
            return unpack_geo_code(self.value() as u16);
        }
        match self.class {
            MetricClass::IpinfoCountryAsn => {
                let geo = (self.id >> 32) as u32;
                let asn = (self.id & 0xFFFF_FFFF) as u32;
                format!("{}-{}", unpack_geo_code(geo as u16), asn)
            }
            MetricClass::IpinfoRegionAsn => {
                let geo = (self.id >> 32) as u32;
                let asn = (self.id & 0xFFFF_FFFF) as u32;
                format!("{geo}-{asn}")
            }
            MetricClass::IcmpTypeCode => {
                let v = self.value();
                format!("{}:{}", v >> 8, v & 0xFF)
            }
            _ => self.value().to_string(),
        }
    }
}

/// Packs a two-letter code into 16 bits, first letter in the low byte.
///
/// Matches the layout produced by the upstream tagger, which reads the
/// code straight out of a two-byte char array.
pub fn pack_geo_code(code: [u8; 2]) -> u16 {
    u16::from(code[0]) | (u16::from(code[1]) << 8)
}

/// Reverses [`pack_geo_code`]. Unknown bytes render as '?'.
pub fn unpack_geo_code(packed: u16) -> String {
    let a = (packed & 0xFF) as u8;
    let b = (packed >> 8) as u8;
    let printable = |c: u8| {
        if c.is_ascii_uppercase() || c.is_ascii_lowercase() || c == b'?' || c.is_ascii_digit() {
            c as char
        } else {
            '?'
        }
    };
    format!("{}{}", printable(a), printable(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_roundtrip() {
        for v in 0..MetricClass::COUNT {
            let class = MetricClass::from_u8(v).expect("valid discriminant");
            assert_eq!(class as u8, v);
        }
        assert!(MetricClass::from_u8(MetricClass::COUNT).is_none());
        assert!(MetricClass::from_u8(255).is_none());
    }

    #[test]
    fn test_scalar_tag_layout() {
        let tag = TagKey::scalar(MetricClass::TcpDstPort, 443);
        assert_eq!(tag.id >> 32, MetricClass::TcpDstPort as u64);
        assert_eq!(tag.value(), 443);
        assert_eq!(tag.format_value(), "443");
    }

    #[test]
    fn test_combined_tag_is_zero() {
        let tag = TagKey::combined();
        assert_eq!(tag.id, 0);
        assert_eq!(tag.format_value(), "all");
    }

    #[test]
    fn test_couplet_tag_packs_both_halves() {
        let cc = u32::from(pack_geo_code(*b"NZ"));
        let tag = TagKey::couplet(MetricClass::IpinfoCountryAsn, cc, 64496);
        assert_eq!(tag.format_value(), "NZ-64496");
    }

    #[test]
    fn test_geo_code_roundtrip() {
        let packed = pack_geo_code(*b"AU");
        assert_eq!(unpack_geo_code(packed), "AU");
        let tag = TagKey::scalar(MetricClass::MaxmindCountry, u32::from(packed));
        assert_eq!(tag.format_value(), "AU");
    }

    #[test]
    fn test_icmp_typecode_format() {
        let tag = TagKey::scalar(MetricClass::IcmpTypeCode, (3 << 8) | 1);
        assert_eq!(tag.format_value(), "3:1");
    }

    #[test]
    fn test_class_mask_all_by_default() {
        let mask = ClassMask::all();
        assert!(mask.allows(MetricClass::Combined));
        assert!(mask.allows(MetricClass::FilterCriteria));
        assert!(mask.allows_all());
    }

    #[test]
    fn test_class_mask_enable_subset() {
        let mut mask = ClassMask::none();
        mask.enable(MetricClass::TcpSrcPort);
        mask.enable(MetricClass::TcpDstPort);
        assert!(mask.allows(MetricClass::TcpSrcPort));
        assert!(!mask.allows(MetricClass::UdpSrcPort));
        assert!(!mask.allows_all());
    }

    #[test]
    fn test_class_mask_disable_from_all() {
        let mut mask = ClassMask::all();
        mask.disable(MetricClass::NetacqRegion);
        assert!(!mask.allows(MetricClass::NetacqRegion));
        assert!(mask.allows(MetricClass::NetacqCountry));
        assert!(mask.allows(MetricClass::Combined));
    }
}
