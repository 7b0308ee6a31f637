//! SMAdata2 wire protocol: framing, checksums and reply parsing.
//!
//! The same application-layer body travels over two L1 framings: a
//! byte-stuffed HDLC-like frame on Bluetooth RFCOMM and a plain "SMA\0"
//! header on Speedwire UDP. Replies from both links are normalized into a
//! single L2 view so the decoder only has one offset map to deal with.

pub mod fcs;
pub mod frame;
pub mod reply;

use std::fmt;
use std::str::FromStr;

use crate::error::SmaError;

/// Size of the communication buffers, both directions.
pub const COMM_BUF_SIZE: usize = 2048;

/// Roster capacity.
pub const MAX_INVERTERS: usize = 20;

/// Re-sends of one request after a receive timeout.
pub const MAX_RETRY: u32 = 3;

/// SUSyID this application presents on the wire.
pub const APP_SUSY_ID: u16 = 125;

/// Wildcard addressing.
pub const ANY_SUSY_ID: u16 = 0xFFFF;
pub const ANY_SERIAL: u32 = 0xFFFF_FFFF;

/// Well-known system-type ids.
pub const SID_MULTIGATE: u16 = 175;
pub const SID_SB240: u16 = 244;

/// L2 signatures.
pub const BTH_L2_SIGNATURE: u32 = 0x6560_03FF;
pub const ETH_L2_SIGNATURE: u32 = 0x6560_1000;

/// Speedwire L1 literals: "SMA\0" plus the fixed tag words.
pub const ETH_L1_MAGIC: u32 = 0x0041_4D53;
pub const ETH_L1_TAG0: u32 = 0xA002_0400;
pub const ETH_L1_TAG1: u32 = 0x0100_0000;

/// Speedwire group address.
pub const MULTICAST_GROUP: [u8; 4] = [239, 12, 255, 254];
pub const SPEEDWIRE_PORT: u16 = 9522;

/// The two physical links carrying SMAdata2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bluetooth,
    Speedwire,
}

/// "Not a number" sentinels used by the inverter for absent measurements.
pub mod nan {
    pub const NAN_S16: i16 = i16::MIN;
    pub const NAN_U16: u16 = u16::MAX;
    pub const NAN_S32: i32 = i32::MIN;
    pub const NAN_U32: u32 = u32::MAX;
    pub const NAN_S64: i64 = i64::MIN;
    pub const NAN_U64: u64 = u64::MAX;

    pub fn is_nan_s32(v: i32) -> bool {
        v == NAN_S32
    }

    pub fn is_nan_u32(v: u32) -> bool {
        v == NAN_U32
    }

    pub fn is_nan_s64(v: i64) -> bool {
        v == NAN_S64
    }

    pub fn is_nan_u64(v: u64) -> bool {
        v == NAN_U64
    }
}

/// Bluetooth device address in wire order (least significant byte first).
///
/// The textual form `12:34:56:78:9A:BC` maps onto bytes `[BC,9A,78,56,34,12]`,
/// which is the order addresses appear inside SMA frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BtAddr(pub [u8; 6]);

impl BtAddr {
    /// Matches any sender.
    pub const UNKNOWN: BtAddr = BtAddr([0xFF; 6]);
    pub const ZERO: BtAddr = BtAddr([0; 6]);

    /// Sender filter: a frame is accepted when every byte matches or the
    /// expected byte is `0xFF`.
    pub fn accepts(&self, sender: BtAddr) -> bool {
        self.0
            .iter()
            .zip(sender.0.iter())
            .all(|(want, got)| *want == 0xFF || want == got)
    }

    /// Address bytes in display order (most significant first), as used by
    /// BlueZ.
    pub fn display_bytes(&self) -> [u8; 6] {
        let mut out = self.0;
        out.reverse();
        out
    }
}

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl FromStr for BtAddr {
    type Err = SmaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(SmaError::BadArg(format!("invalid BT address '{s}'")));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[5 - i] = u8::from_str_radix(part, 16)
                .map_err(|_| SmaError::BadArg(format!("invalid BT address '{s}'")))?;
        }
        Ok(BtAddr(bytes))
    }
}
