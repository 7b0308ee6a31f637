//! Raw byte transport beneath the SMAdata2 framing.
//!
//! Both links expose the same contract: send one frame, receive one frame
//! within a timeout. A transport never concatenates frames; Bluetooth reads
//! exactly one L1 frame using its length header, Speedwire reads one
//! datagram.

pub mod speedwire;

#[cfg(all(feature = "bluetooth", target_os = "linux"))]
pub mod bluetooth;

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{BtAddr, LinkKind};

/// Where a received frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Bluetooth(BtAddr),
    Ip(Ipv4Addr),
}

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub source: FrameSource,
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> LinkKind;

    /// Send one frame. `dst` selects the unicast peer on Speedwire; `None`
    /// means the RFCOMM stream or the multicast group.
    async fn send(&mut self, frame: &[u8], dst: Option<Ipv4Addr>) -> Result<()>;

    /// Receive one full frame, or [`SmaError::NoData`] after `timeout`.
    ///
    /// [`SmaError::NoData`]: crate::error::SmaError::NoData
    async fn recv(&mut self, timeout: Duration) -> Result<RawFrame>;

    /// Discard anything already buffered on the link.
    async fn drain(&mut self);
}
