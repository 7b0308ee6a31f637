//! Bluetooth RFCOMM link (BlueZ, Linux only).
//!
//! SMA inverters speak on RFCOMM channel 1. The stream is a byte pipe; one
//! `recv` reassembles exactly one L1 frame using the length field of its
//! four-byte prologue.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::{FrameSource, RawFrame, Transport};
use crate::error::{Result, SmaError};
use crate::protocol::{BtAddr, LinkKind, COMM_BUF_SIZE};

/// RFCOMM channel used by all SMA Bluetooth devices.
const RFCOMM_CHANNEL: u8 = 1;

/// L1 prologue: SOP, two length bytes, header checksum.
const PROLOGUE_LEN: usize = 4;

pub struct BluetoothLink {
    stream: Stream,
    peer: BtAddr,
}

impl BluetoothLink {
    /// Connect to `peer`, retrying `connect_retries` times with a one second
    /// pause, as cold inverters can take several attempts to answer.
    pub async fn connect(peer: BtAddr, connect_retries: u32) -> Result<BluetoothLink> {
        let addr = SocketAddr::new(bluer::Address::new(peer.display_bytes()), RFCOMM_CHANNEL);

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(%peer, attempt, "connecting RFCOMM channel 1");
            match Stream::connect(addr).await {
                Ok(stream) => return Ok(BluetoothLink { stream, peer }),
                Err(err) if attempt < connect_retries.max(1) => {
                    warn!(%peer, attempt, %err, "RFCOMM connect failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => {
                    return Err(SmaError::Init(format!("RFCOMM connect to {peer}: {err}")))
                }
            }
        }
    }

    pub fn peer(&self) -> BtAddr {
        self.peer
    }

    async fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Err(SmaError::NoData),
        }
    }
}

#[async_trait]
impl Transport for BluetoothLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Bluetooth
    }

    async fn send(&mut self, frame: &[u8], _dst: Option<Ipv4Addr>) -> Result<()> {
        trace!(len = frame.len(), "rfcomm send");
        self.stream.write_all(frame).await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<RawFrame> {
        let mut prologue = [0u8; PROLOGUE_LEN];
        self.read_exact_timeout(&mut prologue, timeout).await?;

        if prologue[0] != 0x7E {
            return Err(SmaError::BadMagic);
        }
        let length = usize::from(prologue[1]) | usize::from(prologue[2]) << 8;
        if length < PROLOGUE_LEN || length > COMM_BUF_SIZE {
            return Err(SmaError::Comm(format!("implausible L1 length {length}")));
        }

        let mut frame = vec![0u8; length];
        frame[..PROLOGUE_LEN].copy_from_slice(&prologue);
        self.read_exact_timeout(&mut frame[PROLOGUE_LEN..], timeout)
            .await?;

        let mut source = [0u8; 6];
        if frame.len() >= 10 {
            source.copy_from_slice(&frame[4..10]);
        }
        trace!(len = length, "rfcomm recv");
        Ok(RawFrame {
            data: frame,
            source: FrameSource::Bluetooth(BtAddr(source)),
        })
    }

    async fn drain(&mut self) {
        let mut buf = [0u8; COMM_BUF_SIZE];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(10), self.stream.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
            trace!(n, "drained stale bytes");
        }
    }
}
