//! Speedwire UDP link.
//!
//! One socket bound to an ephemeral port, joined to the SMA multicast group.
//! Sends go to the group or to a unicast inverter IP, always on port 9522.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{FrameSource, RawFrame, Transport};
use crate::error::{Result, SmaError};
use crate::protocol::{LinkKind, COMM_BUF_SIZE, MULTICAST_GROUP, SPEEDWIRE_PORT};

pub struct SpeedwireLink {
    socket: UdpSocket,
    group: Ipv4Addr,
    port: u16,
}

impl SpeedwireLink {
    pub async fn connect(port: u16) -> Result<SpeedwireLink> {
        let group = Ipv4Addr::from(MULTICAST_GROUP);
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| SmaError::Init(format!("binding UDP socket: {e}")))?;
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| SmaError::Init(format!("joining {group}: {e}")))?;
        socket
            .set_multicast_loop_v4(false)
            .map_err(|e| SmaError::Init(format!("disabling multicast loop: {e}")))?;

        debug!(%group, port, "speedwire socket ready");
        Ok(SpeedwireLink {
            socket,
            group,
            port: if port == 0 { SPEEDWIRE_PORT } else { port },
        })
    }

    pub fn multicast_group(&self) -> Ipv4Addr {
        self.group
    }
}

#[async_trait]
impl Transport for SpeedwireLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Speedwire
    }

    async fn send(&mut self, frame: &[u8], dst: Option<Ipv4Addr>) -> Result<()> {
        let target = SocketAddrV4::new(dst.unwrap_or(self.group), self.port);
        trace!(len = frame.len(), %target, "udp send");
        self.socket.send_to(frame, target).await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<RawFrame> {
        let mut buf = vec![0u8; COMM_BUF_SIZE];
        loop {
            let (len, peer) = match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
                .await
            {
                Ok(io) => io?,
                Err(_elapsed) => return Err(SmaError::NoData),
            };

            // Energy Meter (600) and Sunny Home Manager (608) broadcast on
            // the same group; they are not SMAdata2 replies.
            if len == 600 || len == 608 || len == 0 {
                trace!(len, %peer, "skipping metering broadcast");
                continue;
            }

            trace!(len, %peer, "udp recv");
            let source = match peer.ip() {
                std::net::IpAddr::V4(ip) => FrameSource::Ip(ip),
                std::net::IpAddr::V6(_) => continue,
            };
            buf.truncate(len);
            return Ok(RawFrame { data: buf, source });
        }
    }

    async fn drain(&mut self) {
        let mut buf = [0u8; COMM_BUF_SIZE];
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(10), self.socket.recv_from(&mut buf)).await
        {}
    }
}
