//! Inverter discovery and network initialization.
//!
//! Bluetooth plants need a staged handshake before any SMAdata2 traffic:
//! version probe, bus attach, topology read and (for multi-inverter buses) a
//! network build. Speedwire plants either answer a multicast probe or are
//! configured by IP.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Session, CMD_ANY};
use crate::domain::Inverter;
use crate::error::{Result, SmaError};
use crate::protocol::frame::FrameBuilder;
use crate::protocol::{BtAddr, LinkKind, ANY_SERIAL, ANY_SUSY_ID, ETH_L1_MAGIC, ETH_L1_TAG0, MAX_INVERTERS};

/// Identity query command.
const CMD_IDENTIFY: u32 = 0x0000_0200;

/// "Attach to net" command of the BT control plane.
const CMD_ATTACH_NET: u32 = 0x0070_0400;

/// Topology entry type marking an inverter.
const TOPOLOGY_INVERTER: u16 = 0x0101;

impl Session {
    /// Discover the plant and fill the roster. Dispatches on the transport.
    pub async fn initialise(
        &mut self,
        bt_address: Option<BtAddr>,
        ip_addresses: &[Ipv4Addr],
        multi_inverter: bool,
    ) -> Result<()> {
        // Stale frames from a previous session would desynchronize the
        // handshake.
        self.transport.drain().await;

        match self.kind() {
            LinkKind::Bluetooth => {
                let root = bt_address
                    .ok_or_else(|| SmaError::BadArg("Bluetooth address missing".into()))?;
                if multi_inverter {
                    self.bt_initialise(root).await
                } else {
                    self.bt_initialise_single(root).await
                }
            }
            LinkKind::Speedwire => self.eth_initialise(ip_addresses).await,
        }
    }

    /// Multi-inverter Bluetooth initialization.
    async fn bt_initialise(&mut self, root: BtAddr) -> Result<()> {
        self.roster.clear();
        self.root_device_address = root;

        // Version probe. The destination is the protocol literal
        // 01:00:00:00:00:00, not a device address.
        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0201, self.local_bt_address, BtAddr([1, 0, 0, 0, 0, 0]));
        b.write_bytes(b"ver\r\n");
        b.write_length();
        let frame = b.finish()?.to_vec();
        self.send(&frame, None).await?;

        // The answer can take up to three seconds.
        let reply = self.recv_bt_frame(self.root_device_address, 0x0002).await?;
        let proto_version = reply.raw_u8(19)?;
        if proto_version < 4 {
            // Protocol 3 means firmware older than 1.71.
            return Err(SmaError::FwVersion(proto_version));
        }
        let net_id = reply.raw_u8(22)?;
        info!(net_id, "SMA bus attached");

        // Attach to the net.
        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0002, self.local_bt_address, self.root_device_address);
        b.write_u32(CMD_ATTACH_NET);
        b.write_u8(net_id);
        b.write_u32(0);
        b.write_u32(1);
        b.write_length();
        let frame = b.finish()?.to_vec();
        self.send(&frame, None).await?;

        let reply = self.recv_bt_frame(self.root_device_address, 0x000A).await?;
        if reply.raw_u8(24)? == 2 {
            // The root device moved; follow it.
            let mut addr = [0u8; 6];
            addr.copy_from_slice(reply.raw_slice(18, 6)?);
            self.root_device_address = BtAddr(addr);
        }
        let mut local = [0u8; 6];
        local.copy_from_slice(reply.raw_slice(25, 6)?);
        self.local_bt_address = BtAddr(local);
        debug!(root = %self.root_device_address, local = %self.local_bt_address, "addresses learned");

        let reply = self.recv_bt_frame(self.root_device_address, 0x0005).await?;
        self.parse_topology(&reply.raw, net_id, 0);

        if self.roster.len() == 1 && net_id > 1 {
            self.bt_build_network(net_id).await?;
        }

        self.identify_bt_devices().await?;
        self.logoff().await?;
        Ok(())
    }

    /// Compatibility path for single-inverter plants: wait for the inverter's
    /// own broadcast instead of probing.
    async fn bt_initialise_single(&mut self, root: BtAddr) -> Result<()> {
        self.roster.clear();
        self.root_device_address = root;
        let mut inverter = Inverter::default();
        inverter.bt_address = root;
        self.roster.push(inverter);

        let reply = self.recv_bt_frame(root, 0x0002).await?;
        let net_id = reply.raw_u8(22)?;
        self.roster[0].net_id = net_id;
        info!(net_id, "SMA bus attached (single inverter mode)");

        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0002, self.local_bt_address, root);
        b.write_u32(CMD_ATTACH_NET);
        b.write_u8(net_id);
        b.write_u32(0);
        b.write_u32(1);
        b.write_length();
        let frame = b.finish()?.to_vec();
        self.send(&frame, None).await?;

        let reply = self.recv_bt_frame(root, 0x0005).await?;
        let mut local = [0u8; 6];
        local.copy_from_slice(reply.raw_slice(26, 6)?);
        self.local_bt_address = BtAddr(local);

        // Identify the device.
        let (frame, _) = self.identification_request()?;
        self.send(&frame, None).await?;
        let (reply, _) = self.recv_l2(root).await?;
        self.roster[0].serial = reply.u32_at(57)?;
        info!(serial = self.roster[0].serial, "inverter identified");

        self.logoff().await?;
        Ok(())
    }

    /// Extra 0x03/0x04 handshakes plus a topology re-read; needed when a
    /// multi-inverter bus reports only one device at first contact.
    async fn bt_build_network(&mut self, net_id: u8) -> Result<()> {
        info!("single device on a net_id > 1 bus, rebuilding the network");

        for body in [&[0x0A, 0x00, 0xAC][..], &[0x02, 0x00][..], &[0x01, 0x00, 0x01][..]] {
            let mut b = FrameBuilder::new(LinkKind::Bluetooth);
            b.begin_bt(0x0003, self.local_bt_address, self.root_device_address);
            b.write_bytes(body);
            b.write_length();
            let frame = b.finish()?.to_vec();
            self.send(&frame, None).await?;
            self.recv_bt_frame(self.root_device_address, 0x0004).await?;
        }

        // Wait up to six read timeouts for the bus to settle; small networks
        // finish well within a minute.
        info!("waiting for the network to be built");
        let mut packet_type = 0u16;
        let mut settled = false;
        for _ in 0..6 {
            match self.recv_bt_frame(self.root_device_address, CMD_ANY).await {
                Ok(frame) => {
                    packet_type = frame.command;
                    if packet_type == 0x0005 {
                        self.parse_topology(&frame.raw, net_id, 1);
                    }
                    settled = true;
                    break;
                }
                Err(SmaError::NoData) => continue,
                Err(err) => return Err(err),
            }
        }
        if !settled {
            warn!("network build timed out; single inverter plants should disable multi-inverter support");
            return Err(SmaError::Init("network build timed out".into()));
        }

        if packet_type == 0x1001 {
            let frame = self.recv_bt_frame(self.root_device_address, 0x0005).await?;
            self.parse_topology(&frame.raw, net_id, 1);
            packet_type = frame.command;
        }

        // 0x0006 announces "network ready"; when the topology came first,
        // wait for it and ignore a timeout.
        if packet_type != 0x0006 {
            let _ = self.recv_bt_frame(self.root_device_address, 0x0006).await;
        }
        Ok(())
    }

    /// Read 8-byte topology entries and append inverters to the roster,
    /// starting at `keep` already-known slots.
    fn parse_topology(&mut self, raw: &[u8], net_id: u8, keep: usize) {
        let packet_len = raw
            .get(1)
            .zip(raw.get(2))
            .map(|(lo, hi)| usize::from(*lo) | usize::from(*hi) << 8)
            .unwrap_or(0)
            .min(raw.len());

        self.roster.truncate(keep);
        let mut ptr = 18;
        while ptr + 8 <= packet_len {
            let mut addr = [0u8; 6];
            addr.copy_from_slice(&raw[ptr..ptr + 6]);
            let entry_type = u16::from(raw[ptr + 6]) | u16::from(raw[ptr + 7]) << 8;
            let addr = BtAddr(addr);

            if entry_type == TOPOLOGY_INVERTER {
                if self.roster.len() < MAX_INVERTERS {
                    let mut inverter = Inverter::default();
                    inverter.bt_address = addr;
                    inverter.net_id = net_id;
                    debug!(device = %addr, "topology: inverter");
                    self.roster.push(inverter);
                } else {
                    warn!(limit = MAX_INVERTERS, "roster full, ignoring device");
                }
            } else if addr == self.local_bt_address {
                debug!(device = %addr, "topology: local adapter");
            } else {
                debug!(device = %addr, entry_type, "topology: other device");
            }
            ptr += 8;
        }
    }

    fn identification_request(&mut self) -> Result<(Vec<u8>, u16)> {
        let extra_zero = self.kind() == LinkKind::Speedwire;
        self.build_request(BtAddr::UNKNOWN, 0x09, 0xA0, 0, ANY_SUSY_ID, ANY_SERIAL, move |b| {
            b.write_u32(CMD_IDENTIFY);
            b.write_u32(0);
            b.write_u32(0);
            if extra_zero {
                b.write_u32(0);
            }
        })
    }

    /// Broadcast the identity query and match replies onto roster slots by
    /// source address.
    async fn identify_bt_devices(&mut self) -> Result<()> {
        let (frame, _) = self.identification_request()?;
        self.send(&frame, None).await?;

        for _ in 0..self.roster.len() {
            let (reply, source) = self.recv_l2(BtAddr::UNKNOWN).await?;
            let crate::transport::FrameSource::Bluetooth(mac) = source else {
                continue;
            };
            match self.index_by_bt_address(mac) {
                Some(idx) => {
                    self.roster[idx].susy_id = reply.u16_at(55)?;
                    self.roster[idx].serial = reply.u32_at(57)?;
                    info!(
                        susy_id = self.roster[idx].susy_id,
                        serial = self.roster[idx].serial,
                        "inverter identified"
                    );
                }
                None => debug!(sender = %mac, "identity reply from unknown device"),
            }
        }
        Ok(())
    }

    /// Speedwire discovery: multicast probe when no IP is configured,
    /// otherwise the configured unicast list; then identify each device.
    async fn eth_initialise(&mut self, ip_addresses: &[Ipv4Addr]) -> Result<()> {
        self.roster.clear();

        let discover = ip_addresses.is_empty()
            || (ip_addresses.len() == 1 && ip_addresses[0] == Ipv4Addr::UNSPECIFIED);

        if discover {
            let mut b = FrameBuilder::new(LinkKind::Speedwire);
            b.begin_raw();
            b.write_u32(ETH_L1_MAGIC);
            b.write_u32(ETH_L1_TAG0);
            b.write_u32(0xFFFF_FFFF);
            b.write_u32(0x2000_0000);
            b.write_u32(0x0000_0000);
            let probe = b.finish()?.to_vec();
            self.send(&probe, None).await?;

            loop {
                let raw = match self.transport.recv(Duration::from_secs(2)).await {
                    Ok(raw) => raw,
                    Err(SmaError::NoData) => break,
                    Err(err) => return Err(err),
                };
                if raw.data.len() >= 42 && raw.data.starts_with(b"SMA") {
                    let ip = Ipv4Addr::new(
                        raw.data[38],
                        raw.data[39],
                        raw.data[40],
                        raw.data[41],
                    );
                    info!(%ip, "SMA device answered discovery");
                    let mut inverter = Inverter::default();
                    inverter.ip_address = Some(ip);
                    self.roster.push(inverter);
                    if self.roster.len() >= MAX_INVERTERS {
                        break;
                    }
                }
            }

            if self.roster.is_empty() {
                return Err(SmaError::Init(
                    "no devices answered the discovery query; configure IP addresses".into(),
                ));
            }
        } else {
            for ip in ip_addresses.iter().take(MAX_INVERTERS) {
                let mut inverter = Inverter::default();
                inverter.ip_address = Some(*ip);
                debug!(%ip, "device address from config");
                self.roster.push(inverter);
            }
        }

        for idx in 0..self.roster.len() {
            let (frame, _) = self.identification_request()?;
            self.send_to_device(&frame, idx).await?;

            match self.recv_l2(BtAddr::UNKNOWN).await {
                Ok((reply, _)) => {
                    self.roster[idx].susy_id = reply.src_susy_id()?;
                    self.roster[idx].serial = reply.src_serial()?;
                    info!(
                        ip = ?self.roster[idx].ip_address,
                        susy_id = self.roster[idx].susy_id,
                        serial = self.roster[idx].serial,
                        "inverter identified"
                    );
                    self.logoff_device(idx).await?;
                }
                Err(err) => {
                    // Skip the unresponsive device, keep the rest of the
                    // plant alive.
                    warn!(ip = ?self.roster[idx].ip_address, %err, "inverter did not reply to identification");
                }
            }
        }

        Ok(())
    }

    async fn logoff_device(&mut self, idx: usize) -> Result<()> {
        let (frame, _) = self.build_request(
            BtAddr::UNKNOWN,
            0x08,
            0xA0,
            0x0300,
            ANY_SUSY_ID,
            ANY_SERIAL,
            |b| {
                b.write_u32(0xFFFD_010E);
                b.write_u32(0xFFFF_FFFF);
            },
        )?;
        self.send_to_device(&frame, idx).await
    }
}
