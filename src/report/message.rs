//! Processor-to-tracker wire format.
//!
//! Frames are packed host-endian for single-process delivery only; they
//! never cross a machine boundary. Every frame carries the sender id and
//! a per-(sender, tracker) sequence number so the receiving tracker can
//! detect drops on a lossy transport.

use anyhow::{bail, Result};

use crate::tag::{MetricClass, TagKey};

pub const MSG_UPDATE: u8 = 1;
pub const MSG_INTERVAL: u8 = 2;
pub const MSG_HALT: u8 = 3;
pub const MSG_RESET: u8 = 4;

const HEADER_LEN: usize = 18;
const IP_ENTRY_LEN: usize = 19;
const TAG_ENTRY_LEN: usize = 21;

/// Which end of the packet an IP update describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Src = 1,
    Dst = 2,
}

impl Role {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Role::Src),
            2 => Some(Role::Dst),
            _ => None,
        }
    }

    /// The bit this role occupies in a per-IP metric set entry.
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Per-tag payload inside an IP update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagUpdate {
    pub tag: TagKey,
    pub bytes: u64,
    pub packets: u32,
}

/// One observed IP with the tags it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpUpdate {
    pub ip: u32,
    pub src_asn: u32,
    pub role: Role,
    /// IP-layer bytes carried with the source role only.
    pub bytes: u32,
    pub packets: u32,
    pub tags: Vec<TagUpdate>,
}

/// A decoded frame as the tracker sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerFrame {
    Update {
        sender: u8,
        seqno: u32,
        updates: Vec<IpUpdate>,
    },
    Interval {
        sender: u8,
        seqno: u32,
        timestamp: u32,
    },
    Halt {
        sender: u8,
        seqno: u32,
    },
    Reset {
        sender: u8,
        seqno: u32,
    },
}

impl TrackerFrame {
    pub fn sender(&self) -> u8 {
        match self {
            TrackerFrame::Update { sender, .. }
            | TrackerFrame::Interval { sender, .. }
            | TrackerFrame::Halt { sender, .. }
            | TrackerFrame::Reset { sender, .. } => *sender,
        }
    }

    pub fn seqno(&self) -> u32 {
        match self {
            TrackerFrame::Update { seqno, .. }
            | TrackerFrame::Interval { seqno, .. }
            | TrackerFrame::Halt { seqno, .. }
            | TrackerFrame::Reset { seqno, .. } => *seqno,
        }
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            bail!(
                "truncated tracker frame: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.data.len()
            );
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Encodes an UPDATE frame from a batch of IP updates.
pub fn encode_update(sender: u8, seqno: u32, updates: &[IpUpdate]) -> Vec<u8> {
    let tag_count: usize = updates.iter().map(|u| u.tags.len()).sum();
    let mut buf = Vec::with_capacity(
        HEADER_LEN + updates.len() * IP_ENTRY_LEN + tag_count * TAG_ENTRY_LEN,
    );

    buf.push(MSG_UPDATE);
    buf.push(sender);
    put_u32(&mut buf, 0); // timestamp, valid for INTERVAL only
    put_u32(&mut buf, updates.len() as u32);
    put_u32(&mut buf, seqno);
    put_u32(&mut buf, tag_count as u32);

    for update in updates {
        put_u32(&mut buf, update.ip);
        put_u32(&mut buf, update.src_asn);
        buf.push(update.role as u8);
        put_u16(&mut buf, update.tags.len() as u16);
        put_u32(&mut buf, update.bytes);
        put_u32(&mut buf, update.packets);

        for tag in &update.tags {
            buf.push(tag.tag.class as u8);
            put_u64(&mut buf, tag.tag.id);
            put_u64(&mut buf, tag.bytes);
            put_u32(&mut buf, tag.packets);
        }
    }

    buf
}

/// Encodes a bodyless control frame (INTERVAL, HALT, RESET).
pub fn encode_control(msg_type: u8, sender: u8, seqno: u32, timestamp: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.push(msg_type);
    buf.push(sender);
    put_u32(&mut buf, timestamp);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, seqno);
    put_u32(&mut buf, 0);
    buf
}

/// Decodes a frame received on a tracker inbox.
pub fn decode(data: &[u8]) -> Result<TrackerFrame> {
    let mut cur = Cursor::new(data);

    let msg_type = cur.u8()?;
    let sender = cur.u8()?;
    let timestamp = cur.u32()?;
    let body_count = cur.u32()?;
    let seqno = cur.u32()?;
    let tag_count = cur.u32()?;

    match msg_type {
        MSG_INTERVAL => Ok(TrackerFrame::Interval {
            sender,
            seqno,
            timestamp,
        }),
        MSG_HALT => Ok(TrackerFrame::Halt { sender, seqno }),
        MSG_RESET => Ok(TrackerFrame::Reset { sender, seqno }),
        MSG_UPDATE => {
            // Capacity bounded by what the frame could actually hold, so
            // a corrupt header cannot trigger a huge allocation.
            let max_entries = data.len() / IP_ENTRY_LEN + 1;
            let mut updates = Vec::with_capacity((body_count as usize).min(max_entries));
            let mut tags_seen = 0u32;

            for _ in 0..body_count {
                let ip = cur.u32()?;
                let src_asn = cur.u32()?;
                let role_raw = cur.u8()?;
                let Some(role) = Role::from_u8(role_raw) else {
                    bail!("invalid role {role_raw} in update frame from sender {sender}");
                };
                let numtags = cur.u16()?;
                let bytes = cur.u32()?;
                let packets = cur.u32()?;

                let mut tags = Vec::with_capacity(usize::from(numtags).min(data.len() / TAG_ENTRY_LEN + 1));
                for _ in 0..numtags {
                    let class_raw = cur.u8()?;
                    let Some(class) = MetricClass::from_u8(class_raw) else {
                        bail!("invalid metric class {class_raw} in update frame from sender {sender}");
                    };
                    let id = cur.u64()?;
                    let tag_bytes = cur.u64()?;
                    let tag_packets = cur.u32()?;
                    tags.push(TagUpdate {
                        tag: TagKey { class, id },
                        bytes: tag_bytes,
                        packets: tag_packets,
                    });
                }
                tags_seen += u32::from(numtags);

                updates.push(IpUpdate {
                    ip,
                    src_asn,
                    role,
                    bytes,
                    packets,
                    tags,
                });
            }

            if tags_seen != tag_count {
                bail!(
                    "update frame tag count mismatch: header says {tag_count}, body has {tags_seen}"
                );
            }

            Ok(TrackerFrame::Update {
                sender,
                seqno,
                updates,
            })
        }
        other => bail!("unknown tracker message type {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_updates() -> Vec<IpUpdate> {
        vec![
            IpUpdate {
                ip: 0x0102_0304,
                src_asn: 64496,
                role: Role::Src,
                bytes: 40,
                packets: 1,
                tags: vec![
                    TagUpdate {
                        tag: TagKey::combined(),
                        bytes: 40,
                        packets: 1,
                    },
                    TagUpdate {
                        tag: TagKey::scalar(MetricClass::TcpDstPort, 80),
                        bytes: 40,
                        packets: 1,
                    },
                ],
            },
            IpUpdate {
                ip: 0x0506_0708,
                src_asn: 0,
                role: Role::Dst,
                bytes: 0,
                packets: 0,
                tags: vec![TagUpdate {
                    tag: TagKey::combined(),
                    bytes: 0,
                    packets: 0,
                }],
            },
        ]
    }

    #[test]
    fn test_update_roundtrip() {
        let updates = sample_updates();
        let encoded = encode_update(3, 17, &updates);
        let frame = decode(&encoded).expect("valid frame");

        match frame {
            TrackerFrame::Update {
                sender,
                seqno,
                updates: decoded,
            } => {
                assert_eq!(sender, 3);
                assert_eq!(seqno, 17);
                assert_eq!(decoded, updates);
            }
            other => panic!("expected update frame, got {other:?}"),
        }
    }

    #[test]
    fn test_interval_roundtrip() {
        let encoded = encode_control(MSG_INTERVAL, 1, 42, 1_600_000_020);
        let frame = decode(&encoded).expect("valid frame");
        assert_eq!(
            frame,
            TrackerFrame::Interval {
                sender: 1,
                seqno: 42,
                timestamp: 1_600_000_020,
            }
        );
    }

    #[test]
    fn test_halt_and_reset_roundtrip() {
        let halt = decode(&encode_control(MSG_HALT, 0, 7, 0)).expect("valid halt");
        assert_eq!(halt, TrackerFrame::Halt { sender: 0, seqno: 7 });

        let reset = decode(&encode_control(MSG_RESET, 2, 9, 0)).expect("valid reset");
        assert_eq!(reset, TrackerFrame::Reset { sender: 2, seqno: 9 });
    }

    #[test]
    fn test_couplet_tag_survives_roundtrip() {
        let updates = vec![IpUpdate {
            ip: 1,
            src_asn: 64496,
            role: Role::Src,
            bytes: 100,
            packets: 1,
            tags: vec![TagUpdate {
                tag: TagKey::couplet(MetricClass::IpinfoCountryAsn, 0x5A4E, 64496),
                bytes: 100,
                packets: 1,
            }],
        }];
        let decoded = decode(&encode_update(0, 0, &updates)).expect("valid frame");
        let TrackerFrame::Update { updates: got, .. } = decoded else {
            panic!("expected update frame");
        };
        assert_eq!(got, updates);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let encoded = encode_update(0, 0, &sample_updates());
        for cut in [1, HEADER_LEN - 1, HEADER_LEN + 3, encoded.len() - 1] {
            assert!(decode(&encoded[..cut]).is_err(), "cut at {cut} should fail");
        }
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut encoded = encode_control(MSG_HALT, 0, 0, 0);
        encoded[0] = 99;
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn test_tag_count_mismatch_rejected() {
        let mut encoded = encode_update(0, 0, &sample_updates());
        // Corrupt the header tag_count field (offset 14).
        let bogus = 100u32.to_ne_bytes();
        encoded[14..18].copy_from_slice(&bogus);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn test_empty_update_frame() {
        let encoded = encode_update(5, 1, &[]);
        let frame = decode(&encoded).expect("valid frame");
        assert_eq!(
            frame,
            TrackerFrame::Update {
                sender: 5,
                seqno: 1,
                updates: Vec::new(),
            }
        );
    }
}
