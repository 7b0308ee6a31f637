//! Typed record decoding.
//!
//! Reply payloads carry fixed-size records `[code u32 | datetime u32 |
//! value(s)]`. The code splits into a data type (high byte), a 24-bit
//! Logical Record Index identifying the measurand, and an instance index in
//! the low byte (the MPPT number for DC channels).

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::domain::{DeviceClass, Inverter, Mppt};
use crate::error::{Result, SmaError};
use crate::protocol::nan::{is_nan_s32, is_nan_s64, is_nan_u32, is_nan_u64};
use crate::protocol::reply::ReplyFrame;
use crate::tags::TagCatalog;

/// Logical Record Indexes (measurand identifiers, instance byte zero).
pub mod lri {
    pub const OPERATION_HEALTH: u32 = 0x0021_4800;
    pub const COOLSYS_TMP_NOM: u32 = 0x0023_7700;
    pub const DC_MS_WATT: u32 = 0x0025_1E00;
    pub const METERING_TOT_WH_OUT: u32 = 0x0026_0100;
    pub const METERING_DY_WH_OUT: u32 = 0x0026_2200;
    pub const GRID_MS_TOT_W: u32 = 0x0026_3F00;
    pub const BAT_CHA_STT: u32 = 0x0029_5A00;
    pub const OPERATION_HEALTH_STT_OK: u32 = 0x0041_1E00;
    pub const OPERATION_HEALTH_STT_WRN: u32 = 0x0041_1F00;
    pub const OPERATION_HEALTH_STT_ALM: u32 = 0x0041_2000;
    pub const OPERATION_GRI_SW_STT: u32 = 0x0041_6400;
    pub const OPERATION_RMG_TMS: u32 = 0x0041_6600;
    pub const DC_MS_VOL: u32 = 0x0045_1F00;
    pub const DC_MS_AMP: u32 = 0x0045_2100;
    pub const METERING_TOT_OP_TMS: u32 = 0x0046_2E00;
    pub const METERING_TOT_FEED_TMS: u32 = 0x0046_2F00;
    pub const METERING_GRID_MS_TOT_W_OUT: u32 = 0x0046_3600;
    pub const METERING_GRID_MS_TOT_W_IN: u32 = 0x0046_3700;
    pub const GRID_MS_W_PHS_A: u32 = 0x0046_4000;
    pub const GRID_MS_W_PHS_B: u32 = 0x0046_4100;
    pub const GRID_MS_W_PHS_C: u32 = 0x0046_4200;
    pub const GRID_MS_PH_V_PHS_A: u32 = 0x0046_4800;
    pub const GRID_MS_PH_V_PHS_B: u32 = 0x0046_4900;
    pub const GRID_MS_PH_V_PHS_C: u32 = 0x0046_4A00;
    pub const GRID_MS_A_PHS_A_1: u32 = 0x0046_5000;
    pub const GRID_MS_A_PHS_B_1: u32 = 0x0046_5100;
    pub const GRID_MS_A_PHS_C_1: u32 = 0x0046_5200;
    pub const GRID_MS_A_PHS_A: u32 = 0x0046_5300;
    pub const GRID_MS_A_PHS_B: u32 = 0x0046_5400;
    pub const GRID_MS_A_PHS_C: u32 = 0x0046_5500;
    pub const GRID_MS_HZ: u32 = 0x0046_5700;
    pub const BAT_DIAG_CAPAC_THRP_CNT: u32 = 0x0049_1E00;
    pub const BAT_DIAG_TOT_AH_IN: u32 = 0x0049_2600;
    pub const BAT_DIAG_TOT_AH_OUT: u32 = 0x0049_2700;
    pub const BAT_TMP_VAL: u32 = 0x0049_5B00;
    pub const BAT_VOL: u32 = 0x0049_5C00;
    pub const BAT_AMP: u32 = 0x0049_5D00;
    pub const NAMEPLATE_LOCATION: u32 = 0x0082_1E00;
    pub const NAMEPLATE_MAIN_MODEL: u32 = 0x0082_1F00;
    pub const NAMEPLATE_MODEL: u32 = 0x0082_2000;
    pub const NAMEPLATE_PKG_REV: u32 = 0x0082_3400;
    pub const INVERTER_W_LIM: u32 = 0x0083_2A00;
}

/// Data type carried in the high byte of the record code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmaDataType {
    Ulong,
    Status,
    Text,
    Float,
    Slong,
    Unknown(u8),
}

impl SmaDataType {
    pub fn from_code(code: u32) -> SmaDataType {
        match (code >> 24) as u8 {
            0 => SmaDataType::Ulong,
            8 => SmaDataType::Status,
            16 => SmaDataType::Text,
            32 => SmaDataType::Float,
            64 => SmaDataType::Slong,
            other => SmaDataType::Unknown(other),
        }
    }
}

/// Extract the tag attributes of a STATUS record: four-byte entries starting
/// at offset 8, terminated by `0x00FFFFFE`; an entry whose high byte is 1 is
/// the selected value.
pub fn status_attributes(rec: &[u8]) -> Vec<u32> {
    let mut tags = Vec::new();
    let mut idx = 8;
    while idx + 4 <= rec.len() {
        let attribute = LittleEndian::read_u32(&rec[idx..idx + 4]);
        let tag = attribute & 0x00FF_FFFF;
        if tag == 0x00FF_FFFE {
            break;
        }
        if attribute >> 24 == 1 {
            tags.push(tag);
        }
        idx += 4;
    }
    tags
}

/// Firmware revision formatting: BCD major/minor, decimal build, release
/// type letter out of "NEABRS".
pub fn version_to_string(version: u32) -> String {
    let release = (version & 0xFF) as usize;
    let release = *b"NEABRS".get(release).unwrap_or(&b'?') as char;
    let build = (version >> 8) & 0xFF;
    let minor = (version >> 16) & 0xFF;
    let major = (version >> 24) & 0xFF;
    format!(
        "{}{}.{}{}.{:02}.{}",
        major >> 4,
        major & 0x0F,
        minor >> 4,
        minor & 0x0F,
        build,
        release
    )
}

fn record_string(rec: &[u8]) -> String {
    let bytes = &rec[8..];
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Fold the typed records of one live-data reply into the device state.
pub fn decode_live(reply: &ReplyFrame, dev: &mut Inverter, tags: &TagCatalog) -> Result<()> {
    let record_size = reply.inferred_record_size()?;
    if record_size == 0 || record_size > 64 {
        return Err(SmaError::Comm(format!(
            "implausible record size {record_size}"
        )));
    }

    for rec in reply.records(record_size) {
        decode_record(rec, record_size, dev, tags);
    }
    Ok(())
}

fn decode_record(rec: &[u8], record_size: usize, dev: &mut Inverter, tags: &TagCatalog) {
    let code = LittleEndian::read_u32(&rec[0..4]);
    let lri_code = code & 0x00FF_FF00;
    let cls = (code & 0xFF) as u8;
    let data_type = SmaDataType::from_code(code);
    let datetime = i64::from(LittleEndian::read_u32(&rec[4..8]));

    // 16-byte records carry a single 64-bit counter; everything else keeps
    // its semantic value at offset 16. NaN sentinels read as zero.
    let mut value64: i64 = 0;
    let mut value: i32 = 0;
    if record_size == 16 {
        let raw = LittleEndian::read_i64(&rec[8..16]);
        if !is_nan_s64(raw) && !is_nan_u64(raw as u64) {
            value64 = raw;
        }
    } else if data_type != SmaDataType::Text
        && data_type != SmaDataType::Status
        && rec.len() >= 20
    {
        let raw = LittleEndian::read_i32(&rec[16..20]);
        if !is_nan_s32(raw) && !is_nan_u32(raw as u32) {
            value = raw;
        }
    }

    match lri_code {
        lri::GRID_MS_TOT_W => {
            // Record timestamp doubles as the moment the inverter went to
            // sleep when queried after sunset.
            dev.sleep_time = datetime;
            dev.total_pac = value;
        }
        lri::GRID_MS_W_PHS_A => dev.pac1 = value,
        lri::GRID_MS_W_PHS_B => dev.pac2 = value,
        lri::GRID_MS_W_PHS_C => dev.pac3 = value,
        lri::GRID_MS_PH_V_PHS_A => dev.uac1 = value,
        lri::GRID_MS_PH_V_PHS_B => dev.uac2 = value,
        lri::GRID_MS_PH_V_PHS_C => dev.uac3 = value,
        lri::GRID_MS_A_PHS_A | lri::GRID_MS_A_PHS_A_1 => dev.iac1 = value,
        lri::GRID_MS_A_PHS_B | lri::GRID_MS_A_PHS_B_1 => dev.iac2 = value,
        lri::GRID_MS_A_PHS_C | lri::GRID_MS_A_PHS_C_1 => dev.iac3 = value,
        lri::GRID_MS_HZ => dev.grid_freq = value,
        lri::DC_MS_WATT => {
            dev.mpp.entry(cls).or_insert_with(Mppt::default).pdc = value;
            dev.cal_pdc_tot += value;
        }
        lri::DC_MS_VOL => {
            dev.mpp.entry(cls).or_insert_with(Mppt::default).udc = value;
        }
        lri::DC_MS_AMP => {
            dev.mpp.entry(cls).or_insert_with(Mppt::default).idc = value;
        }
        lri::METERING_TOT_WH_OUT => {
            // Some models omit the day counter; this record's timestamp is
            // then the best inverter clock reading available.
            dev.inverter_datetime = datetime;
            dev.e_total = value64;
        }
        lri::METERING_DY_WH_OUT => {
            dev.inverter_datetime = datetime;
            dev.e_today = value64;
        }
        lri::METERING_TOT_OP_TMS => dev.operation_time = value64,
        lri::METERING_TOT_FEED_TMS => dev.feed_in_time = value64,
        lri::NAMEPLATE_LOCATION => {
            dev.wakeup_time = datetime;
            dev.device_name = record_string(rec);
        }
        lri::NAMEPLATE_PKG_REV => {
            if rec.len() >= 28 {
                dev.sw_version = version_to_string(LittleEndian::read_u32(&rec[24..28]));
            }
        }
        lri::NAMEPLATE_MODEL => {
            if let Some(tag) = status_attributes(rec).first() {
                match tags.description(*tag) {
                    Some(descr) => dev.device_type = descr.to_string(),
                    None => {
                        dev.device_type = "UNKNOWN TYPE".to_string();
                        warn!(tag, "unknown inverter model tag");
                    }
                }
            }
        }
        lri::NAMEPLATE_MAIN_MODEL => {
            if let Some(tag) = status_attributes(rec).first() {
                dev.device_class =
                    DeviceClass::from_repr(*tag).unwrap_or(DeviceClass::AllDevices);
                dev.device_class_name = tags.description_or(*tag, "UNKNOWN CLASS").to_string();
            }
        }
        lri::OPERATION_HEALTH => {
            if let Some(tag) = status_attributes(rec).first() {
                dev.device_status = *tag;
            }
        }
        lri::OPERATION_GRI_SW_STT => {
            if let Some(tag) = status_attributes(rec).first() {
                dev.grid_relay_status = *tag;
            }
        }
        lri::BAT_CHA_STT => dev.bat_cha_stt = value as u32,
        lri::BAT_DIAG_CAPAC_THRP_CNT => dev.bat_diag_capac_thrp_cnt = value as u32,
        lri::BAT_DIAG_TOT_AH_IN => dev.bat_diag_tot_ah_in = value as u32,
        lri::BAT_DIAG_TOT_AH_OUT => dev.bat_diag_tot_ah_out = value as u32,
        lri::BAT_TMP_VAL => dev.bat_tmp_val = value as u32,
        lri::BAT_VOL => dev.bat_vol = value as u32,
        lri::BAT_AMP => dev.bat_amp = value,
        lri::COOLSYS_TMP_NOM => dev.temperature = value,
        lri::METERING_GRID_MS_TOT_W_OUT => dev.metering_grid_ms_tot_w_out = value,
        lri::METERING_GRID_MS_TOT_W_IN => dev.metering_grid_ms_tot_w_in = value,
        other => {
            debug!(
                code = format_args!("{code:08X}"),
                record_size,
                descr = tags.description_for_lri(other).unwrap_or(""),
                "undecoded record"
            );
        }
    }
}

/// A 40-byte signed parameter record (min/max limits plus actual values),
/// used by the parameter read and power-limit write paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamRecord {
    pub lri: u32,
    pub datetime: i64,
    pub min_ll: i32,
    pub max_ll: i32,
    pub min_ul: i32,
    pub max_ul: i32,
    pub min_actual: i32,
    pub max_actual: i32,
    pub res1: i32,
    pub res2: i32,
}

impl ParamRecord {
    pub const WIRE_LEN: usize = 40;

    pub fn from_wire(rec: &[u8]) -> Result<ParamRecord> {
        if rec.len() < Self::WIRE_LEN {
            return Err(SmaError::ShortFrame {
                needed: Self::WIRE_LEN,
                len: rec.len(),
            });
        }
        Ok(ParamRecord {
            lri: LittleEndian::read_u32(&rec[0..4]),
            datetime: i64::from(LittleEndian::read_u32(&rec[4..8])),
            min_ll: LittleEndian::read_i32(&rec[8..12]),
            max_ll: LittleEndian::read_i32(&rec[12..16]),
            min_ul: LittleEndian::read_i32(&rec[16..20]),
            max_ul: LittleEndian::read_i32(&rec[20..24]),
            min_actual: LittleEndian::read_i32(&rec[24..28]),
            max_actual: LittleEndian::read_i32(&rec[28..32]),
            res1: LittleEndian::read_i32(&rec[32..36]),
            res2: LittleEndian::read_i32(&rec[36..40]),
        })
    }
}
