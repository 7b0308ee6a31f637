//! Inbound frame parsing.
//!
//! Both links are normalized into the same L2 view: one prefix byte (the raw
//! `0x7E` L2 start on Bluetooth, a zero dummy on Speedwire) followed by the
//! SMAdata2 header and payload. All field access goes through checked
//! offsets; a truncated frame surfaces as [`SmaError::ShortFrame`] instead of
//! an out-of-bounds read.

use byteorder::{ByteOrder, LittleEndian};

use super::{BtAddr, LinkKind, BTH_L2_SIGNATURE, COMM_BUF_SIZE, ETH_L2_SIGNATURE};
use crate::error::{Result, SmaError};

/// Byte offsets in the normalized L2 view.
mod off {
    pub const LONGWORDS: usize = 5;
    pub const DST_SUSY_ID: usize = 7;
    pub const DST_SERIAL: usize = 9;
    pub const SRC_SUSY_ID: usize = 15;
    pub const SRC_SERIAL: usize = 17;
    pub const ERROR_CODE: usize = 23;
    pub const FRAGMENT: usize = 25;
    pub const PACKET_ID: usize = 27;
    pub const COMMAND: usize = 29;
    pub const FIRST_RECORD: usize = 33;
    pub const LAST_RECORD: usize = 37;
    pub const RECORDS: usize = 41;
}

/// A raw Bluetooth L1 frame, split into header fields and (when present) the
/// un-stuffed L2 region.
#[derive(Debug, Clone)]
pub struct BtFrame {
    pub command: u16,
    pub source: BtAddr,
    pub dest: BtAddr,
    /// The complete frame as received (still stuffed). Control replies carry
    /// their payload here, addressed by L1 offsets.
    pub raw: Vec<u8>,
    l2: Option<Vec<u8>>,
}

/// L1 header: SOP, length, header checksum, source, destination, command.
pub const BT_HEADER_LEN: usize = 18;

impl BtFrame {
    pub fn parse(data: &[u8]) -> Result<BtFrame> {
        if data.len() < BT_HEADER_LEN {
            return Err(SmaError::ShortFrame {
                needed: BT_HEADER_LEN,
                len: data.len(),
            });
        }
        if data[0] != 0x7E {
            return Err(SmaError::BadMagic);
        }
        if data[3] != data[0] ^ data[1] ^ data[2] {
            return Err(SmaError::ChecksumMismatch);
        }
        let length = usize::from(LittleEndian::read_u16(&data[1..3]));
        if data.len() < length {
            return Err(SmaError::ShortFrame {
                needed: length,
                len: data.len(),
            });
        }

        let mut source = [0u8; 6];
        source.copy_from_slice(&data[4..10]);
        let mut dest = [0u8; 6];
        dest.copy_from_slice(&data[10..16]);
        let command = LittleEndian::read_u16(&data[16..18]);

        let l2 = if length > BT_HEADER_LEN + 5
            && data[BT_HEADER_LEN] == 0x7E
            && LittleEndian::read_u32(&data[BT_HEADER_LEN + 1..BT_HEADER_LEN + 5]) == BTH_L2_SIGNATURE
        {
            Some(unstuff(&data[BT_HEADER_LEN..length])?)
        } else {
            None
        };

        Ok(BtFrame {
            command,
            source: BtAddr(source),
            dest: BtAddr(dest),
            raw: data[..length].to_vec(),
            l2,
        })
    }

    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    /// Take the normalized L2 view out of the frame.
    pub fn into_reply(self) -> Result<ReplyFrame> {
        match self.l2 {
            Some(data) => Ok(ReplyFrame {
                data,
                kind: LinkKind::Bluetooth,
            }),
            None => Err(SmaError::BadMagic),
        }
    }

    /// Byte at an L1 offset of the raw frame.
    pub fn raw_u8(&self, offset: usize) -> Result<u8> {
        self.raw
            .get(offset)
            .copied()
            .ok_or(SmaError::ShortFrame {
                needed: offset + 1,
                len: self.raw.len(),
            })
    }

    pub fn raw_u16(&self, offset: usize) -> Result<u16> {
        let end = offset + 2;
        if self.raw.len() < end {
            return Err(SmaError::ShortFrame {
                needed: end,
                len: self.raw.len(),
            });
        }
        Ok(LittleEndian::read_u16(&self.raw[offset..end]))
    }

    pub fn raw_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset + len;
        if self.raw.len() < end {
            return Err(SmaError::ShortFrame {
                needed: end,
                len: self.raw.len(),
            });
        }
        Ok(&self.raw[offset..end])
    }
}

/// Remove byte stuffing; the first byte (the raw L2 start) is kept as-is.
fn unstuff(stuffed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(stuffed.len());
    let mut escape = false;
    for (i, b) in stuffed.iter().enumerate() {
        if i == 0 {
            out.push(*b);
            continue;
        }
        if escape {
            out.push(*b ^ 0x20);
            escape = false;
        } else if *b == 0x7D {
            escape = true;
        } else {
            out.push(*b);
        }
        if out.len() > COMM_BUF_SIZE {
            return Err(SmaError::BufferOverflow);
        }
    }
    if escape {
        return Err(SmaError::StuffingError);
    }
    Ok(out)
}

/// The normalized SMAdata2 reply.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    data: Vec<u8>,
    kind: LinkKind,
}

impl ReplyFrame {
    /// Parse a Speedwire datagram. Datagrams whose L2 signature does not
    /// match yield [`SmaError::Retry`] so the caller keeps reading.
    pub fn from_datagram(data: &[u8]) -> Result<ReplyFrame> {
        if data.len() < 18 {
            return Err(SmaError::ShortFrame {
                needed: 18,
                len: data.len(),
            });
        }
        if &data[0..4] != b"SMA\0" {
            return Err(SmaError::BadMagic);
        }
        let pk_len = usize::from(data[12]) << 8 | usize::from(data[13]);
        if pk_len == 0 {
            return Err(SmaError::NoData);
        }
        if LittleEndian::read_u32(&data[14..18]) != ETH_L2_SIGNATURE {
            return Err(SmaError::Retry);
        }
        let mut normalized = Vec::with_capacity(data.len() - 13);
        normalized.push(0);
        normalized.extend_from_slice(&data[14..]);
        Ok(ReplyFrame {
            data: normalized,
            kind: LinkKind::Speedwire,
        })
    }

    /// Wrap an already-normalized buffer; test and decoder plumbing.
    pub fn from_normalized(data: Vec<u8>, kind: LinkKind) -> ReplyFrame {
        ReplyFrame { data, kind }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        self.data.get(offset).copied().ok_or(SmaError::ShortFrame {
            needed: offset + 1,
            len: self.data.len(),
        })
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.slice(offset, 2)?))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.slice(offset, 4)?))
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.slice(offset, 8)?))
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset + len;
        if self.data.len() < end {
            return Err(SmaError::ShortFrame {
                needed: end,
                len: self.data.len(),
            });
        }
        Ok(&self.data[offset..end])
    }

    pub fn longwords(&self) -> Result<u8> {
        self.u8_at(off::LONGWORDS)
    }

    pub fn dst_susy_id(&self) -> Result<u16> {
        self.u16_at(off::DST_SUSY_ID)
    }

    pub fn dst_serial(&self) -> Result<u32> {
        self.u32_at(off::DST_SERIAL)
    }

    pub fn src_susy_id(&self) -> Result<u16> {
        self.u16_at(off::SRC_SUSY_ID)
    }

    pub fn src_serial(&self) -> Result<u32> {
        self.u32_at(off::SRC_SERIAL)
    }

    pub fn error_code(&self) -> Result<u16> {
        self.u16_at(off::ERROR_CODE)
    }

    /// Remaining fragments; counts down to zero on the last frame.
    pub fn fragment_count(&self) -> Result<u16> {
        self.u16_at(off::FRAGMENT)
    }

    /// Packet id with the wire high bit masked off.
    pub fn packet_id(&self) -> Result<u16> {
        Ok(self.u16_at(off::PACKET_ID)? & 0x7FFF)
    }

    pub fn command(&self) -> Result<u32> {
        self.u32_at(off::COMMAND)
    }

    pub fn first_record(&self) -> Result<u32> {
        self.u32_at(off::FIRST_RECORD)
    }

    pub fn last_record(&self) -> Result<u32> {
        self.u32_at(off::LAST_RECORD)
    }

    pub const RECORDS_START: usize = off::RECORDS;

    /// One past the last payload byte: Bluetooth frames end with FCS + 0x7E.
    pub fn payload_end(&self) -> usize {
        match self.kind {
            LinkKind::Bluetooth => self.data.len().saturating_sub(3),
            LinkKind::Speedwire => self.data.len(),
        }
    }

    /// Record size from the reply's own record span:
    /// `4 * (longwords - 9) / (last - first + 1)`.
    pub fn inferred_record_size(&self) -> Result<usize> {
        let longwords = u32::from(self.longwords()?);
        let first = self.first_record()?;
        let last = self.last_record()?;
        let span = last.wrapping_sub(first).wrapping_add(1);
        if span == 0 || longwords < 9 {
            return Err(SmaError::Comm("degenerate record span".into()));
        }
        Ok((4 * (longwords - 9) / span) as usize)
    }

    /// Iterate complete records of `size` bytes.
    pub fn records(&self, size: usize) -> impl Iterator<Item = &[u8]> {
        let end = self.payload_end();
        let start = off::RECORDS.min(end);
        self.data[start..end].chunks_exact(size.max(1))
    }

    /// Recompute the FCS over the un-stuffed payload; Bluetooth only.
    pub fn fcs_is_valid(&self) -> bool {
        if self.kind != LinkKind::Bluetooth || self.data.len() < 5 {
            return false;
        }
        super::fcs::check(&self.data[1..self.data.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame::FrameBuilder;
    use super::*;

    fn sample_bt_frame(payload_marker: u8) -> Vec<u8> {
        let local: BtAddr = "00:11:22:33:44:55".parse().unwrap();
        let dest: BtAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0001, local, dest);
        b.open_l2(0x09, 0xA0, 0, 0xFFFF, 0xFFFF_FFFF, 125, 0x3938_0001, 0x0123);
        b.write_u32(0x0000_0200);
        b.write_u32(0);
        b.write_u32(u32::from(payload_marker));
        b.write_trailer();
        b.write_length();
        b.finish().unwrap().to_vec()
    }

    #[test]
    fn bt_round_trip() {
        let raw = sample_bt_frame(0x42);
        let frame = BtFrame::parse(&raw).unwrap();
        assert_eq!(frame.command, 0x0001);
        assert_eq!(frame.source.to_string(), "00:11:22:33:44:55");
        assert!(frame.has_l2());

        let reply = frame.into_reply().unwrap();
        assert!(reply.fcs_is_valid());
        assert_eq!(reply.packet_id().unwrap(), 0x0123);
        assert_eq!(reply.command().unwrap(), 0x0000_0200);
        // Here the reply's "dst" is what the builder addressed.
        assert_eq!(reply.dst_susy_id().unwrap(), 0xFFFF);
        assert_eq!(reply.src_susy_id().unwrap(), 125);
        assert_eq!(reply.src_serial().unwrap(), 0x3938_0001);
    }

    #[test]
    fn bt_fcs_detects_corruption() {
        let mut raw = sample_bt_frame(0x42);
        // Flip a payload byte inside the L2 region.
        let idx = raw.len() - 6;
        raw[idx] ^= 0x01;
        let frame = BtFrame::parse(&raw).unwrap();
        let reply = frame.into_reply().unwrap();
        assert!(!reply.fcs_is_valid());
    }

    #[test]
    fn truncated_escape_is_a_stuffing_error() {
        let mut raw = sample_bt_frame(0x7E); // forces an escape near the end
        // Cut the frame inside the escape sequence and fix up the length.
        let cut = raw
            .iter()
            .rposition(|b| *b == 0x7D)
            .expect("stuffed byte present");
        raw.truncate(cut + 1);
        raw[1] = (raw.len() & 0xFF) as u8;
        raw[2] = ((raw.len() >> 8) & 0xFF) as u8;
        raw[3] = raw[0] ^ raw[1] ^ raw[2];
        assert!(matches!(
            BtFrame::parse(&raw),
            Err(SmaError::StuffingError)
        ));
    }

    #[test]
    fn short_l1_header_rejected() {
        assert!(matches!(
            BtFrame::parse(&[0x7E, 0x05, 0x00]),
            Err(SmaError::ShortFrame { .. })
        ));
    }

    #[test]
    fn datagram_round_trip() {
        let mut b = FrameBuilder::new(LinkKind::Speedwire);
        b.begin_eth();
        b.open_l2(0x0E, 0xA0, 0x0100, 0x007D, 0x1234_5678, 125, 0x3938_0001, 0x7001);
        b.write_u32(0xFFFD_040C);
        b.write_trailer();
        b.write_length();
        let datagram = b.finish().unwrap().to_vec();

        let reply = ReplyFrame::from_datagram(&datagram).unwrap();
        assert_eq!(reply.packet_id().unwrap(), 0x7001);
        assert_eq!(reply.dst_susy_id().unwrap(), 0x007D);
        assert_eq!(reply.dst_serial().unwrap(), 0x1234_5678);
        assert_eq!(reply.command().unwrap(), 0xFFFD_040C);
    }

    #[test]
    fn datagram_bad_magic() {
        assert!(matches!(
            ReplyFrame::from_datagram(&[0u8; 32]),
            Err(SmaError::BadMagic)
        ));
    }

    #[test]
    fn short_reads_surface_as_short_frame() {
        let reply = ReplyFrame::from_normalized(vec![0u8; 10], LinkKind::Speedwire);
        assert!(matches!(
            reply.packet_id(),
            Err(SmaError::ShortFrame { needed: 29, .. })
        ));
    }

    #[test]
    fn record_size_inference() {
        // longwords = 9 + records * size/4; span of 2 records of 12 bytes.
        let mut data = vec![0u8; 64];
        data[5] = 9 + 6; // 24 bytes of records
        data[33..37].copy_from_slice(&1u32.to_le_bytes());
        data[37..41].copy_from_slice(&2u32.to_le_bytes());
        let reply = ReplyFrame::from_normalized(data, LinkKind::Speedwire);
        assert_eq!(reply.inferred_record_size().unwrap(), 12);
    }
}
