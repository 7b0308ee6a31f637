//! Typed queries and the request/reply loop.
//!
//! One query addresses one device: the request names a command word plus an
//! LRI range, the reply arrives as one or more fragments correlated by
//! packet id. Receive timeouts trigger a bounded number of re-sends; a
//! checksum failure aborts the query for that device.

use tracing::{debug, warn};

use crate::domain::Inverter;
use crate::error::{Result, SmaError};
use crate::protocol::{BtAddr, LinkKind, MAX_INVERTERS, MAX_RETRY, SID_SB240};
use crate::records::{self, ParamRecord};
use crate::session::Session;

/// The canonical live-data query set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    EnergyProduction,
    SpotDcPower,
    SpotDcVoltage,
    SpotAcPower,
    SpotAcVoltage,
    SpotGridFrequency,
    SpotAcTotalPower,
    TypeLabel,
    OperationTime,
    SoftwareVersion,
    DeviceStatus,
    GridRelayStatus,
    BatteryChargeStatus,
    BatteryInfo,
    InverterTemperature,
    MeteringGridMsTotW,
}

impl Query {
    /// `(command, first LRI, last LRI)` triple of this query.
    pub fn params(self) -> (u32, u32, u32) {
        match self {
            Query::EnergyProduction => (0x5400_0200, 0x0026_0100, 0x0026_22FF),
            Query::SpotDcPower => (0x5380_0200, 0x0025_1E00, 0x0025_1EFF),
            Query::SpotDcVoltage => (0x5380_0200, 0x0045_1F00, 0x0045_21FF),
            Query::SpotAcPower => (0x5100_0200, 0x0046_4000, 0x0046_42FF),
            Query::SpotAcVoltage => (0x5100_0200, 0x0046_4800, 0x0046_55FF),
            Query::SpotGridFrequency => (0x5100_0200, 0x0046_5700, 0x0046_57FF),
            Query::SpotAcTotalPower => (0x5100_0200, 0x0026_3F00, 0x0026_3FFF),
            Query::TypeLabel => (0x5800_0200, 0x0082_1E00, 0x0082_20FF),
            Query::OperationTime => (0x5400_0200, 0x0046_2E00, 0x0046_2FFF),
            Query::SoftwareVersion => (0x5800_0200, 0x0082_3400, 0x0082_34FF),
            Query::DeviceStatus => (0x5180_0200, 0x0021_4800, 0x0021_48FF),
            Query::GridRelayStatus => (0x5180_0200, 0x0041_6400, 0x0041_64FF),
            Query::BatteryChargeStatus => (0x5100_0200, 0x0029_5A00, 0x0029_5AFF),
            Query::BatteryInfo => (0x5100_0200, 0x0049_1E00, 0x0049_5DFF),
            Query::InverterTemperature => (0x5200_0200, 0x0023_7700, 0x0023_77FF),
            Query::MeteringGridMsTotW => (0x5100_0200, 0x0046_3600, 0x0046_37FF),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Query::EnergyProduction => "EnergyProduction",
            Query::SpotDcPower => "SpotDCPower",
            Query::SpotDcVoltage => "SpotDCVoltage",
            Query::SpotAcPower => "SpotACPower",
            Query::SpotAcVoltage => "SpotACVoltage",
            Query::SpotGridFrequency => "SpotGridFrequency",
            Query::SpotAcTotalPower => "SpotACTotalPower",
            Query::TypeLabel => "TypeLabel",
            Query::OperationTime => "OperationTime",
            Query::SoftwareVersion => "SoftwareVersion",
            Query::DeviceStatus => "DeviceStatus",
            Query::GridRelayStatus => "GridRelayStatus",
            Query::BatteryChargeStatus => "BatteryChargeStatus",
            Query::BatteryInfo => "BatteryInfo",
            Query::InverterTemperature => "InverterTemperature",
            Query::MeteringGridMsTotW => "MeteringGridMsTotW",
        }
    }
}

impl Session {
    /// Run `query` against every roster device, retrying timeouts per
    /// device. The last per-device error is returned after all devices had
    /// their turn.
    pub async fn fetch_data(&mut self, query: Query) -> Result<()> {
        let mut outcome = Ok(());
        for idx in 0..self.roster.len() {
            let mut retries = MAX_RETRY;
            let result = loop {
                match self.fetch_device_data(idx, query).await {
                    Err(SmaError::NoData) if retries > 1 => {
                        retries -= 1;
                        debug!(device = idx, query = query.name(), retries, "retrying");
                    }
                    other => break other,
                }
            };
            if let Err(err) = result {
                warn!(device = idx, query = query.name(), %err, "query failed");
                outcome = Err(err);
            }
        }
        outcome
    }

    /// One query round against one device.
    pub async fn fetch_device_data(&mut self, idx: usize, query: Query) -> Result<()> {
        let (command, first, last) = query.params();
        let (susy_id, serial, bt_address) = {
            let dev = &self.roster[idx];
            (dev.susy_id, dev.serial, dev.bt_address)
        };
        let ctrl = if susy_id == SID_SB240 { 0xE0 } else { 0xA0 };

        let (frame, packet_id) =
            self.build_request(BtAddr::UNKNOWN, 0x09, ctrl, 0, susy_id, serial, |b| {
                b.write_u32(command);
                b.write_u32(first);
                b.write_u32(last);
            })?;
        self.send_to_device(&frame, idx).await?;

        let expect = match self.kind() {
            LinkKind::Bluetooth => bt_address,
            LinkKind::Speedwire => BtAddr::UNKNOWN,
        };

        let mut matched = false;
        loop {
            let (reply, _) = self.recv_l2(expect).await?;

            if let Some(err) = SmaError::from_device_status(reply.error_code()?) {
                debug!(device = idx, status = reply.error_code()?, "reply status");
                return Err(err);
            }

            let fragments = reply.fragment_count()?;
            if reply.packet_id()? != packet_id {
                debug!(
                    expected = packet_id,
                    received = reply.packet_id()?,
                    "packet id mismatch"
                );
                continue;
            }
            if reply.src_susy_id()? != susy_id || reply.src_serial()? != serial {
                debug!(device = idx, "reply from a different device, still waiting");
                continue;
            }

            let (roster, tags) = (&mut self.roster, &self.tags);
            records::decode_live(&reply, &mut roster[idx], tags)?;
            matched = true;

            if fragments == 0 {
                break;
            }
        }

        debug_assert!(matched);
        Ok(())
    }

    /// Read a 40-byte parameter record (`Rec40S32` layout).
    pub async fn get_param(&mut self, idx: usize, lri: u32, cmd: u16) -> Result<ParamRecord> {
        let (susy_id, serial, bt_address) = {
            let dev = &self.roster[idx];
            (dev.susy_id, dev.serial, dev.bt_address)
        };
        let ctrl = if susy_id == SID_SB240 { 0xE0 } else { 0xA0 };

        let (frame, packet_id) =
            self.build_request(bt_address, 0x09, ctrl, 0, susy_id, serial, |b| {
                b.write_u16(0x0200);
                b.write_u16(cmd);
                b.write_u32(lri);
                b.write_u32(lri | 0xFF);
            })?;
        self.send_to_device(&frame, idx).await?;

        loop {
            let (reply, _) = self.recv_l2(BtAddr::UNKNOWN).await?;
            if reply.packet_id()? != packet_id {
                debug!("packet id mismatch");
                continue;
            }
            if reply.src_serial()? != serial {
                debug!("serial mismatch");
                continue;
            }

            let mut param = None;
            for rec in reply.records(ParamRecord::WIRE_LEN) {
                param = Some(ParamRecord::from_wire(rec)?);
            }
            return param.ok_or(SmaError::NoData);
        }
    }

    /// Write a parameter record; the power-limit set path. No reply is
    /// expected.
    pub async fn set_param(
        &mut self,
        idx: usize,
        lri: u32,
        cmd: u16,
        data: &ParamRecord,
    ) -> Result<()> {
        let (susy_id, serial, bt_address) = {
            let dev = &self.roster[idx];
            (dev.susy_id, dev.serial, dev.bt_address)
        };
        let now = chrono::Utc::now().timestamp() as u32;
        let data = *data;

        let (frame, _) =
            self.build_request(bt_address, 0x12, 0xE0, 0x0100, susy_id, serial, move |b| {
                b.write_u16(0x010E);
                b.write_u16(cmd);
                b.write_u32(0x0A);
                b.write_u32(lri | 0x0200_0001);
                b.write_u32(now);
                b.write_u32(data.min_ll as u32);
                b.write_u32(data.max_ll as u32);
                b.write_u32(data.min_ul as u32);
                b.write_u32(data.max_ul as u32);
                b.write_u32(data.min_actual as u32);
                b.write_u32(data.max_actual as u32);
                b.write_u32(data.res1 as u32);
                b.write_u32(data.res2 as u32);
            })?;
        self.send_to_device(&frame, idx).await
    }

    /// Enumerate the SB-240 micro-inverters attached to a multigate and
    /// append them to the roster. Speedwire only.
    pub async fn fetch_device_list(&mut self, multigate_idx: usize) -> Result<()> {
        const DEVICE_RECORD_LEN: usize = 32;

        if self.roster.len() >= MAX_INVERTERS {
            warn!("roster full before multigate expansion");
            return Err(SmaError::BufferOverflow);
        }
        let (susy_id, serial, ip) = {
            let mg = &self.roster[multigate_idx];
            (mg.susy_id, mg.serial, mg.ip_address)
        };

        let (frame, packet_id) =
            self.build_request(BtAddr::ZERO, 0x09, 0xE0, 0, susy_id, serial, |b| {
                b.write_u16(0x0200);
                b.write_u16(0xFFF5);
                b.write_u32(0);
                b.write_u32(0xFFFF_FFFF);
            })?;
        self.send(&frame, ip).await?;

        loop {
            let (reply, _) = self.recv_l2(BtAddr::UNKNOWN).await?;
            if let Some(err) = SmaError::from_device_status(reply.error_code()?) {
                warn!(%err, "device list query rejected");
                return Err(err);
            }
            if reply.packet_id()? != packet_id {
                debug!("packet id mismatch");
                continue;
            }
            if reply.src_serial()? != serial {
                debug!("serial mismatch");
                continue;
            }

            let mut found = 0usize;
            for rec in reply.records(DEVICE_RECORD_LEN) {
                let devclass = u16::from(rec[4]) | u16::from(rec[5]) << 8;
                if devclass != 3 {
                    continue;
                }
                if self.roster.len() >= MAX_INVERTERS {
                    warn!("roster full, dropping multigate children");
                    return Err(SmaError::BufferOverflow);
                }
                let mut child = Inverter::default();
                child.susy_id = u16::from(rec[6]) | u16::from(rec[7]) << 8;
                child.serial = u32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]);
                child.ip_address = ip;
                child.multigate_id = Some(multigate_idx);
                debug!(
                    susy_id = child.susy_id,
                    serial = child.serial,
                    "multigate child"
                );
                self.roster.push(child);
                found += 1;
            }

            if found == 0 {
                return Err(SmaError::NoData);
            }
            return Ok(());
        }
    }
}
