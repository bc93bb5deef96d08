//! Per-tracker interval state: IP entries and metric tallies.
//!
//! A tracker accumulates one [`IntervalMaps`] per in-flight interval.
//! Each observed address owns a small per-interval set of (tag, role)
//! marks that decides whether the address has already contributed to a
//! tag's unique counts. Most addresses on a telescope match only a
//! handful of tags, so the set starts as an inline array and spills into
//! a hash map on overflow.

use std::collections::{HashMap, HashSet};

use crate::config::IpCounting;
use crate::report::message::{IpUpdate, Role};
use crate::tag::TagKey;

/// Cross-references recorded when a couplet tally is first created.
pub const MAX_ASSOCIATED_TAGS: usize = 8;

/// Inline capacity of a per-IP metric set before spilling.
const INLINE_METRIC_SLOTS: usize = 10;

/// Set of (tag, role) marks for one address in one interval.
#[derive(Debug)]
pub enum MetricSet {
    Inline {
        len: u8,
        slots: [(TagKey, u8); INLINE_METRIC_SLOTS],
    },
    Spilled(HashMap<TagKey, u8>),
}

impl MetricSet {
    pub fn new() -> Self {
        MetricSet::Inline {
            len: 0,
            slots: [(TagKey::combined(), 0); INLINE_METRIC_SLOTS],
        }
    }

    /// Marks (tag, role) as seen. Returns true when the role bit was not
    /// previously set for this tag, i.e. the address should count toward
    /// the tag's unique tally for that role.
    pub fn mark(&mut self, tag: TagKey, role: Role) -> bool {
        let bit = role.bit();

        match self {
            MetricSet::Inline { len, slots } => {
                let used = usize::from(*len);
                for slot in slots.iter_mut().take(used) {
                    if slot.0 == tag {
                        let fresh = slot.1 & bit == 0;
                        slot.1 |= bit;
                        return fresh;
                    }
                }

                if used < INLINE_METRIC_SLOTS {
                    slots[used] = (tag, bit);
                    *len += 1;
                    return true;
                }

                // Inline array is full: spill to a hash map and retry.
                let mut map = HashMap::with_capacity(INLINE_METRIC_SLOTS * 2);
                for &(t, bits) in slots.iter() {
                    map.insert(t, bits);
                }
                let fresh = match map.entry(tag) {
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        let fresh = e.get() & bit == 0;
                        *e.get_mut() |= bit;
                        fresh
                    }
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(bit);
                        true
                    }
                };
                *self = MetricSet::Spilled(map);
                fresh
            }
            MetricSet::Spilled(map) => match map.entry(tag) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    let fresh = e.get() & bit == 0;
                    *e.get_mut() |= bit;
                    fresh
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(bit);
                    true
                }
            },
        }
    }

    /// Number of distinct tags seen for this address.
    pub fn len(&self) -> usize {
        match self {
            MetricSet::Inline { len, .. } => usize::from(*len),
            MetricSet::Spilled(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        MetricSet::new()
    }
}

/// One observed address within the current interval.
#[derive(Debug, Default)]
pub struct IpEntry {
    pub metrics: MetricSet,
}

/// Running tally for one tag within one interval.
#[derive(Debug, Default)]
pub struct MetricTally {
    pub packets: u64,
    pub bytes: u64,
    pub unique_src_ips: u32,
    pub unique_dst_ips: u32,
    /// Distinct source ASNs seen for this tag; len() is the unique count.
    pub src_asns: HashSet<u32>,
    /// Tags from other classes recorded at tally creation, capped at
    /// [`MAX_ASSOCIATED_TAGS`].
    pub associated: Vec<TagKey>,
}

impl MetricTally {
    pub fn push_associated(&mut self, tag: TagKey) {
        if self.associated.len() < MAX_ASSOCIATED_TAGS && !self.associated.contains(&tag) {
            self.associated.push(tag);
        }
    }
}

/// All aggregation state for one interval of one tracker.
#[derive(Debug, Default)]
pub struct IntervalMaps {
    /// Keyed by the normalized uniqueness key, not the raw address.
    pub ips: HashMap<u32, IpEntry>,
    pub tallies: HashMap<TagKey, MetricTally>,
}

impl IntervalMaps {
    pub fn new() -> Self {
        IntervalMaps::default()
    }

    /// Applies one decoded IP update to this interval.
    ///
    /// Byte and packet charges ride with the source role only; a
    /// destination update contributes nothing but unique-dst marks.
    pub fn absorb(&mut self, update: &IpUpdate, src_counting: IpCounting, dst_counting: IpCounting) {
        let ip_key = match update.role {
            Role::Src => src_counting.key(update.ip),
            Role::Dst => dst_counting.key(update.ip),
        };

        let entry = self.ips.entry(ip_key).or_default();

        for tag_update in &update.tags {
            let tally = match self.tallies.entry(tag_update.tag) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let mut tally = MetricTally::default();
                    // Couplet tallies remember the component tags they
                    // were derived from, so consumers can de-aggregate.
                    let components = tag_update.tag.class.couplet_components();
                    if !components.is_empty() {
                        for other in &update.tags {
                            if components.contains(&other.tag.class) {
                                tally.push_associated(other.tag);
                            }
                        }
                    }
                    e.insert(tally)
                }
            };

            if tag_update.packets > 0 {
                tally.packets += u64::from(tag_update.packets);
                tally.bytes += tag_update.bytes;
            }

            match update.role {
                Role::Src => {
                    if entry.metrics.mark(tag_update.tag, Role::Src) {
                        tally.unique_src_ips += 1;
                    }
                    if update.src_asn != 0 {
                        tally.src_asns.insert(update.src_asn);
                    }
                }
                Role::Dst => {
                    if entry.metrics.mark(tag_update.tag, Role::Dst) {
                        tally.unique_dst_ips += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpCountMethod;
    use crate::report::message::TagUpdate;
    use crate::tag::MetricClass;

    fn exact() -> IpCounting {
        IpCounting {
            method: IpCountMethod::All,
            prefix_bits: 32,
        }
    }

    fn update(ip: u32, asn: u32, role: Role, bytes: u32, tags: &[TagKey]) -> IpUpdate {
        IpUpdate {
            ip,
            src_asn: asn,
            role,
            bytes,
            packets: u32::from(role == Role::Src),
            tags: tags
                .iter()
                .map(|&tag| TagUpdate {
                    tag,
                    bytes: u64::from(bytes),
                    packets: u32::from(role == Role::Src),
                })
                .collect(),
        }
    }

    #[test]
    fn test_metric_set_marks_once_per_role() {
        let mut set = MetricSet::new();
        let tag = TagKey::combined();

        assert!(set.mark(tag, Role::Src));
        assert!(!set.mark(tag, Role::Src));
        // Same tag, other role still counts once.
        assert!(set.mark(tag, Role::Dst));
        assert!(!set.mark(tag, Role::Dst));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_metric_set_spills_to_map() {
        let mut set = MetricSet::new();
        for port in 0..INLINE_METRIC_SLOTS as u32 + 5 {
            let tag = TagKey::scalar(MetricClass::TcpDstPort, port);
            assert!(set.mark(tag, Role::Src));
        }
        assert!(matches!(set, MetricSet::Spilled(_)));
        assert_eq!(set.len(), INLINE_METRIC_SLOTS + 5);

        // Marks made while inline survive the spill.
        assert!(!set.mark(TagKey::scalar(MetricClass::TcpDstPort, 0), Role::Src));
        assert!(set.mark(TagKey::scalar(MetricClass::TcpDstPort, 0), Role::Dst));
    }

    #[test]
    fn test_absorb_src_charges_bytes_once() {
        let mut maps = IntervalMaps::new();
        let combined = TagKey::combined();

        maps.absorb(
            &update(0x0102_0304, 64496, Role::Src, 40, &[combined]),
            exact(),
            exact(),
        );
        maps.absorb(
            &update(0x0102_0304, 64496, Role::Src, 60, &[combined]),
            exact(),
            exact(),
        );

        let tally = maps.tallies.get(&combined).expect("tally exists");
        assert_eq!(tally.packets, 2);
        assert_eq!(tally.bytes, 100);
        assert_eq!(tally.unique_src_ips, 1);
        assert_eq!(tally.src_asns.len(), 1);
    }

    #[test]
    fn test_absorb_dst_contributes_unique_only() {
        let mut maps = IntervalMaps::new();
        let combined = TagKey::combined();

        maps.absorb(
            &update(0x0506_0708, 0, Role::Dst, 0, &[combined]),
            exact(),
            exact(),
        );

        let tally = maps.tallies.get(&combined).expect("tally exists");
        assert_eq!(tally.packets, 0);
        assert_eq!(tally.bytes, 0);
        assert_eq!(tally.unique_src_ips, 0);
        assert_eq!(tally.unique_dst_ips, 1);
    }

    #[test]
    fn test_absorb_prefixagg_collapses_ips() {
        let mut maps = IntervalMaps::new();
        let combined = TagKey::combined();
        let agg = IpCounting {
            method: IpCountMethod::PrefixAgg,
            prefix_bits: 24,
        };

        for host in 1..=50u32 {
            maps.absorb(
                &update(0x0102_0300 | host, 0, Role::Src, 40, &[combined]),
                agg,
                exact(),
            );
        }
        maps.absorb(
            &update(0x0909_0901, 0, Role::Src, 40, &[combined]),
            agg,
            exact(),
        );

        let tally = maps.tallies.get(&combined).expect("tally exists");
        assert_eq!(tally.unique_src_ips, 2);
        // Packet and byte charges are unaffected by collapsing.
        assert_eq!(tally.packets, 51);
    }

    #[test]
    fn test_absorb_zero_asn_not_counted() {
        let mut maps = IntervalMaps::new();
        let combined = TagKey::combined();

        maps.absorb(
            &update(0x0102_0304, 0, Role::Src, 40, &[combined]),
            exact(),
            exact(),
        );
        let tally = maps.tallies.get(&combined).expect("tally exists");
        assert_eq!(tally.src_asns.len(), 0);
    }

    #[test]
    fn test_couplet_tally_records_associated_tags() {
        let mut maps = IntervalMaps::new();
        let country = TagKey::scalar(MetricClass::IpinfoCountry, 0x5A4E);
        let asn = TagKey::scalar(MetricClass::PrefixAsn, 64496);
        let couplet = TagKey::couplet(MetricClass::IpinfoCountryAsn, 0x5A4E, 64496);

        maps.absorb(
            &update(1, 64496, Role::Src, 40, &[country, asn, couplet]),
            exact(),
            exact(),
        );

        let tally = maps.tallies.get(&couplet).expect("couplet tally");
        assert!(tally.associated.contains(&country));
        assert!(tally.associated.contains(&asn));

        let scalar_tally = maps.tallies.get(&country).expect("country tally");
        assert!(scalar_tally.associated.is_empty());
    }

    #[test]
    fn test_unique_counts_per_tag_not_global() {
        let mut maps = IntervalMaps::new();
        let combined = TagKey::combined();
        let port80 = TagKey::scalar(MetricClass::TcpDstPort, 80);

        maps.absorb(
            &update(1, 0, Role::Src, 40, &[combined, port80]),
            exact(),
            exact(),
        );
        maps.absorb(
            &update(2, 0, Role::Src, 40, &[combined]),
            exact(),
            exact(),
        );

        assert_eq!(maps.tallies[&combined].unique_src_ips, 2);
        assert_eq!(maps.tallies[&port80].unique_src_ips, 1);
    }
}
