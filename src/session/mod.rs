//! Process-wide SMA session.
//!
//! Owns the transport, the application identity presented on the wire, the
//! packet-id counter and the discovered roster. All frame construction and
//! reply collection funnels through here so there is no ambient mutable
//! state; the polling task is the single writer.

pub mod discovery;

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::domain::{Inverter, UserGroup};
use crate::error::{Result, SmaError};
use crate::protocol::frame::FrameBuilder;
use crate::protocol::reply::{BtFrame, ReplyFrame};
use crate::protocol::{BtAddr, LinkKind, ANY_SERIAL, ANY_SUSY_ID, APP_SUSY_ID, MAX_INVERTERS, SID_MULTIGATE, SID_SB240};
use crate::tags::TagCatalog;
use crate::transport::{FrameSource, Transport};

/// Logon command words.
const CMD_LOGIN: u32 = 0xFFFD_040C;
const CMD_LOGOFF: u32 = 0xFFFD_010E;
const CMD_SET_TIME: u32 = 0xF000_020A;

/// Probe word echoed by the time query.
const TIME_PROBE: u32 = 0x0023_6D00;

/// Session timeout literal carried in the logon request (900 s).
const LOGIN_TIMEOUT: u32 = 0x0000_0384;

/// Wait-for-any command marker on the Bluetooth control plane.
pub(crate) const CMD_ANY: u16 = 0xFF;

/// Outcome of a time synchronization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSync {
    Adjusted,
    InSync,
    Skipped,
}

pub struct Session {
    pub(crate) transport: Box<dyn Transport>,
    pub app_susy_id: u16,
    pub app_serial: u32,
    pub(crate) packet_id: u16,
    pub local_bt_address: BtAddr,
    pub root_device_address: BtAddr,
    pub roster: Vec<Inverter>,
    pub has_battery_device: bool,
    pub tags: TagCatalog,
    pub(crate) recv_timeout: Duration,
}

/// Fresh per-process session serial, in the range the vendor tooling uses.
pub fn gen_session_id() -> u32 {
    900_000_000 + rand::thread_rng().gen_range(0..100_000_000)
}

/// Password bytes as sent on the wire: each character biased by the group
/// byte, padded with the bias itself.
pub fn encode_password(group: UserGroup, password: &str) -> [u8; 12] {
    let bias = group.password_bias();
    let mut out = [bias; 12];
    for (slot, byte) in out.iter_mut().zip(password.bytes()) {
        *slot = byte.wrapping_add(bias);
    }
    out
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, tags: TagCatalog, recv_timeout: Duration) -> Session {
        let session = Session {
            transport,
            app_susy_id: APP_SUSY_ID,
            app_serial: gen_session_id(),
            packet_id: 0,
            local_bt_address: BtAddr::ZERO,
            root_device_address: BtAddr::ZERO,
            roster: Vec::new(),
            has_battery_device: false,
            tags,
            recv_timeout,
        };
        info!(
            susy_id = session.app_susy_id,
            serial = session.app_serial,
            "session identity"
        );
        session
    }

    pub fn kind(&self) -> LinkKind {
        self.transport.kind()
    }

    pub fn last_packet_id(&self) -> u16 {
        self.packet_id
    }

    pub(crate) fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1) & 0x7FFF;
        self.packet_id
    }

    /// Roster slot whose BT address matches `addr`.
    pub fn index_by_bt_address(&self, addr: BtAddr) -> Option<usize> {
        self.roster.iter().position(|inv| inv.bt_address == addr)
    }

    /// Build one SMAdata2 request. The packet-id is bumped per attempt until
    /// the resulting FCS avoids the reserved wire bytes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_request(
        &mut self,
        dst_bt: BtAddr,
        longwords: u8,
        ctrl: u8,
        ctrl2: u16,
        dst_susy_id: u16,
        dst_serial: u32,
        payload: impl Fn(&mut FrameBuilder),
    ) -> Result<(Vec<u8>, u16)> {
        loop {
            let packet_id = self.next_packet_id();
            let mut b = FrameBuilder::new(self.kind());
            match self.kind() {
                LinkKind::Bluetooth => b.begin_bt(0x0001, self.local_bt_address, dst_bt),
                LinkKind::Speedwire => b.begin_eth(),
            }
            b.open_l2(
                longwords,
                ctrl,
                ctrl2,
                dst_susy_id,
                dst_serial,
                self.app_susy_id,
                self.app_serial,
                packet_id,
            );
            payload(&mut b);
            b.write_trailer();
            b.write_length();
            if b.crc_is_wire_safe() {
                return Ok((b.finish()?.to_vec(), packet_id));
            }
            debug!(packet_id, "FCS hit a reserved byte, rotating packet id");
        }
    }

    pub(crate) async fn send(&mut self, frame: &[u8], dst: Option<Ipv4Addr>) -> Result<()> {
        self.transport.send(frame, dst).await
    }

    pub(crate) async fn send_to_device(&mut self, frame: &[u8], idx: usize) -> Result<()> {
        let dst = match self.kind() {
            LinkKind::Bluetooth => None,
            LinkKind::Speedwire => self.roster[idx].ip_address,
        };
        self.transport.send(frame, dst).await
    }

    /// Receive one Bluetooth control frame from `expected`, waiting for the
    /// given L1 command (`CMD_ANY` accepts everything).
    pub(crate) async fn recv_bt_frame(
        &mut self,
        expected: BtAddr,
        wait_cmd: u16,
    ) -> Result<BtFrame> {
        loop {
            let raw = self.transport.recv(self.recv_timeout).await?;
            let frame = match BtFrame::parse(&raw.data) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%err, "discarding unparsable L1 frame");
                    continue;
                }
            };
            if !expected.accepts(frame.source) {
                debug!(sender = %frame.source, "wrong sender");
                continue;
            }
            if wait_cmd != CMD_ANY && frame.command != wait_cmd {
                debug!(command = frame.command, wait_cmd, "skipping command");
                continue;
            }
            return Ok(frame);
        }
    }

    /// Receive one SMAdata2 reply, normalized across both links. Bluetooth
    /// frames have their FCS verified here.
    pub(crate) async fn recv_l2(&mut self, expected: BtAddr) -> Result<(ReplyFrame, FrameSource)> {
        match self.kind() {
            LinkKind::Bluetooth => loop {
                let frame = self.recv_bt_frame(expected, 0x0001).await?;
                if !frame.has_l2() {
                    debug!("command 1 frame without L2 signature");
                    continue;
                }
                let source = FrameSource::Bluetooth(frame.source);
                let reply = frame.into_reply()?;
                if !reply.fcs_is_valid() {
                    return Err(SmaError::ChecksumMismatch);
                }
                return Ok((reply, source));
            },
            LinkKind::Speedwire => loop {
                let raw = self.transport.recv(self.recv_timeout).await?;
                match ReplyFrame::from_datagram(&raw.data) {
                    Ok(reply) => return Ok((reply, raw.source)),
                    Err(SmaError::Retry) => {
                        debug!("datagram without L2 signature");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            },
        }
    }

    /// Log on every roster device.
    ///
    /// Over Bluetooth a single broadcast fans out and each inverter replies
    /// once; replies are drained through a bounded queue and matched to
    /// roster slots by source address until every slot answered or the
    /// deadline passes. Over Speedwire each device is logged on by itself.
    pub async fn logon(&mut self, group: UserGroup, password: &str) -> Result<()> {
        let pw = encode_password(group, password);
        debug!(group = group.as_str(), "logging on");

        match self.kind() {
            LinkKind::Bluetooth => self.logon_broadcast(group, &pw).await,
            LinkKind::Speedwire => self.logon_per_device(group, &pw).await,
        }
    }

    async fn logon_broadcast(&mut self, group: UserGroup, pw: &[u8; 12]) -> Result<()> {
        let now = Utc::now().timestamp() as u32;
        let (frame, packet_id) = self.build_request(
            BtAddr::UNKNOWN,
            0x0E,
            0xA0,
            0x0100,
            ANY_SUSY_ID,
            ANY_SERIAL,
            |b| {
                b.write_u32(CMD_LOGIN);
                b.write_u32(group.code());
                b.write_u32(LOGIN_TIMEOUT);
                b.write_u32(now);
                b.write_u32(0);
                b.write_bytes(pw);
            },
        )?;
        self.send(&frame, None).await?;

        let mut answered = vec![false; self.roster.len()];
        let mut queue: VecDeque<(ReplyFrame, FrameSource)> =
            VecDeque::with_capacity(MAX_INVERTERS);
        let deadline = tokio::time::Instant::now()
            + self.recv_timeout * (self.roster.len() as u32 + 2);
        let mut status = Ok(());

        while answered.iter().any(|done| !done) {
            if tokio::time::Instant::now() >= deadline {
                warn!("logon deadline reached before all inverters replied");
                return Err(SmaError::NoData);
            }
            let reply = self.recv_l2(BtAddr::UNKNOWN).await?;
            queue.push_back(reply);

            while let Some((reply, source)) = queue.pop_front() {
                if reply.packet_id()? != packet_id || reply.u32_at(41)? != now {
                    debug!("unexpected logon reply, waiting for the next one");
                    continue;
                }
                let FrameSource::Bluetooth(mac) = source else {
                    continue;
                };
                let Some(idx) = self.index_by_bt_address(mac) else {
                    debug!(sender = %mac, "logon reply from unknown device");
                    continue;
                };
                self.roster[idx].susy_id = reply.src_susy_id()?;
                self.roster[idx].serial = reply.src_serial()?;
                answered[idx] = true;
                if let Some(err) = SmaError::from_device_status(reply.error_code()?) {
                    warn!(device = idx, %err, "logon rejected");
                    status = Err(err);
                }
            }
        }

        status
    }

    async fn logon_per_device(&mut self, group: UserGroup, pw: &[u8; 12]) -> Result<()> {
        let mut status = Ok(());
        for idx in 0..self.roster.len() {
            let now = Utc::now().timestamp() as u32;
            let (susy_id, serial) = (self.roster[idx].susy_id, self.roster[idx].serial);
            let ctrl = if susy_id == SID_SB240 { 0xE0 } else { 0xA0 };
            let (frame, packet_id) =
                self.build_request(BtAddr::UNKNOWN, 0x0E, ctrl, 0x0100, susy_id, serial, |b| {
                    b.write_u32(CMD_LOGIN);
                    b.write_u32(group.code());
                    b.write_u32(LOGIN_TIMEOUT);
                    b.write_u32(now);
                    b.write_u32(0);
                    b.write_bytes(pw);
                })?;
            self.send_to_device(&frame, idx).await?;

            loop {
                let (reply, _) = self.recv_l2(BtAddr::UNKNOWN).await?;
                if reply.packet_id()? != packet_id {
                    debug!(
                        expected = packet_id,
                        received = reply.packet_id()?,
                        "packet id mismatch"
                    );
                    continue;
                }
                if let Some(err) = SmaError::from_device_status(reply.error_code()?) {
                    warn!(device = idx, %err, "logon rejected");
                    status = Err(err);
                }
                break;
            }
        }
        status
    }

    /// Log off. Broadcast over Bluetooth, per device over Speedwire. No
    /// reply is expected either way.
    pub async fn logoff(&mut self) -> Result<()> {
        match self.kind() {
            LinkKind::Bluetooth => self.send_logoff(None).await,
            LinkKind::Speedwire => {
                for idx in 0..self.roster.len() {
                    let dst = self.roster[idx].ip_address;
                    self.send_logoff(dst).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_logoff(&mut self, dst: Option<Ipv4Addr>) -> Result<()> {
        let (frame, _) = self.build_request(
            BtAddr::UNKNOWN,
            0x08,
            0xA0,
            0x0300,
            ANY_SUSY_ID,
            ANY_SERIAL,
            |b| {
                b.write_u32(CMD_LOGOFF);
                b.write_u32(0xFFFF_FFFF);
            },
        )?;
        self.send(&frame, dst).await
    }

    /// Multigate children hold their own sessions; close them one by one.
    pub async fn logoff_multigate_children(&mut self) -> Result<()> {
        for mg in 0..self.roster.len() {
            if self.roster[mg].susy_id != SID_MULTIGATE {
                continue;
            }
            for child in 0..self.roster.len() {
                if self.roster[child].susy_id != SID_SB240
                    || self.roster[child].multigate_id != Some(mg)
                {
                    continue;
                }
                let (susy_id, serial) = (self.roster[child].susy_id, self.roster[child].serial);
                let (frame, _) =
                    self.build_request(BtAddr::ZERO, 0x08, 0xE0, 0x0300, susy_id, serial, |b| {
                        b.write_u32(CMD_LOGOFF);
                        b.write_u32(0xFFFF_FFFF);
                    })?;
                self.send_to_device(&frame, child).await?;
                info!(susy_id, serial, "logged off multigate child");
            }
        }
        Ok(())
    }

    /// Read the plant clock and adjust it to host time when the drift falls
    /// inside `[low_limit, high_limit]` seconds and the last adjustment is at
    /// least `every_days` ago. All limits zero bypasses the guards (manual
    /// resync). Bluetooth only; Speedwire plants take their time from the
    /// LAN.
    pub async fn sync_plant_time(
        &mut self,
        every_days: i64,
        low_limit: i64,
        high_limit: i64,
    ) -> Result<TimeSync> {
        if self.kind() != LinkKind::Bluetooth {
            return Ok(TimeSync::Skipped);
        }

        let (frame, _) = self.build_request(
            BtAddr::UNKNOWN,
            0x10,
            0xA0,
            0,
            ANY_SUSY_ID,
            ANY_SERIAL,
            |b| {
                b.write_u32(CMD_SET_TIME);
                b.write_u32(TIME_PROBE);
                b.write_u32(TIME_PROBE);
                b.write_u32(TIME_PROBE);
                for _ in 0..4 {
                    b.write_u32(0);
                }
                b.write_u32(1);
                b.write_u32(1);
            },
        )?;
        self.send(&frame, None).await?;

        let host_time = Utc::now().timestamp();

        // The inverter answers with a mismatched packet id; accept anything.
        let (reply, _) = self.recv_l2(BtAddr::UNKNOWN).await?;
        if reply.len() != 72 {
            warn!(len = reply.len(), "unexpected time reply length");
            return Err(SmaError::Comm("unexpected time reply".into()));
        }
        if reply.u32_at(41)? != TIME_PROBE {
            return Err(SmaError::Comm("time probe echo missing".into()));
        }

        let plant_time = i64::from(reply.u32_at(45)?);
        let last_time_set = i64::from(reply.u32_at(49)?);
        let tz_word = reply.u32_at(57)?;
        let tz = tz_word & 0xFFFF_FFFE;
        let dst = tz_word & 1;
        // Opaque counter echoed back incremented; semantics unknown.
        let magic = reply.u32_at(61)?;

        let drift = (plant_time - host_time).abs();
        info!(
            plant_time,
            host_time,
            drift,
            tz,
            dst,
            last_time_set,
            "plant clock read"
        );

        if low_limit == 0 && high_limit == 0 {
            if drift == 0 {
                return Ok(TimeSync::InSync);
            }
        } else {
            if drift > high_limit {
                info!(drift, high_limit, "drift too large, leaving plant time alone");
                return Ok(TimeSync::Skipped);
            }
            if drift < low_limit {
                return Ok(TimeSync::InSync);
            }
            let days_ago = (host_time - host_time % 86_400 - (last_time_set - last_time_set % 86_400)) / 86_400;
            if days_ago < every_days {
                debug!(days_ago, "time already adjusted recently");
                return Ok(TimeSync::Skipped);
            }
        }

        let new_time = Utc::now().timestamp() as u32;
        let (frame, _) = self.build_request(
            BtAddr::UNKNOWN,
            0x10,
            0xA0,
            0,
            ANY_SUSY_ID,
            ANY_SERIAL,
            |b| {
                b.write_u32(CMD_SET_TIME);
                b.write_u32(TIME_PROBE);
                b.write_u32(TIME_PROBE);
                b.write_u32(TIME_PROBE);
                b.write_u32(new_time);
                b.write_u32(new_time);
                b.write_u32(new_time);
                b.write_u32(tz | dst);
                b.write_u32(magic.wrapping_add(1));
                b.write_u32(1);
            },
        )?;
        self.send(&frame, None).await?;
        // No reply expected.
        info!(new_time, "plant time adjusted");
        Ok(TimeSync::Adjusted)
    }

    /// Link quality of the primary inverter, percent.
    pub async fn bt_signal_strength(&mut self, idx: usize) -> Result<f32> {
        if self.kind() != LinkKind::Bluetooth {
            return Ok(0.0);
        }
        let dest = self.roster[idx].bt_address;
        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0003, self.local_bt_address, dest);
        b.write_u8(0x05);
        b.write_u8(0x00);
        b.write_length();
        let frame = b.finish()?.to_vec();
        self.send(&frame, None).await?;

        let reply = self.recv_bt_frame(dest, 0x0004).await?;
        let signal = f32::from(reply.raw_u8(22)?) * 100.0 / 255.0;
        self.roster[idx].bt_signal = signal;
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_encoding_user_group() {
        let wire = encode_password(UserGroup::User, "0000");
        assert_eq!(&wire[..4], &[b'0' + 0x88; 4]);
        assert_eq!(&wire[4..], &[0x88; 8]);
    }

    #[test]
    fn password_encoding_installer_group() {
        let wire = encode_password(UserGroup::Installer, "secret");
        for (i, c) in "secret".bytes().enumerate() {
            assert_eq!(wire[i], c.wrapping_add(0xBB));
        }
        assert_eq!(&wire[6..], &[0xBB; 6]);
    }

    #[test]
    fn password_is_truncated_to_twelve_bytes() {
        let wire = encode_password(UserGroup::User, "0123456789ABCDEF");
        assert_eq!(wire.len(), 12);
        assert_eq!(wire[11], b'B'.wrapping_add(0x88));
    }

    #[test]
    fn session_id_range() {
        for _ in 0..32 {
            let id = gen_session_id();
            assert!((900_000_000..1_000_000_000).contains(&id));
        }
    }
}
