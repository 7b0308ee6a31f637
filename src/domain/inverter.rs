//! Per-device state accumulated over a polling cycle.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use strum::{Display, FromRepr};

use crate::protocol::nan::NAN_S32;
use crate::protocol::{BtAddr, SID_MULTIGATE, SID_SB240};

/// Slots per civil day at five-minute resolution.
pub const DAY_DATA_LEN: usize = 288;

/// Slots per civil month at one-day resolution.
pub const MONTH_DATA_LEN: usize = 31;

/// SMA device class as reported by the `NameplateMainModel` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr, serde::Serialize)]
#[repr(u32)]
pub enum DeviceClass {
    AllDevices = 8000,
    SolarInverter = 8001,
    WindTurbineInverter = 8002,
    BatteryInverter = 8007,
    ChargingStation = 8008,
    HybridInverter = 8009,
    Consumer = 8033,
    SensorSystem = 8064,
    ElectricityMeter = 8065,
    GasMeter = 8066,
    GenericMeter = 8067,
    Tracker = 8096,
    CommunicationProduct = 8128,
}

impl Default for DeviceClass {
    fn default() -> Self {
        DeviceClass::AllDevices
    }
}

/// One MPP tracker input. Raw units: W, cV, mA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mppt {
    pub pdc: i32,
    pub udc: i32,
    pub idc: i32,
}

impl Mppt {
    pub fn watt(&self) -> f32 {
        self.pdc as f32
    }

    pub fn kw(&self) -> f32 {
        self.pdc as f32 / 1000.0
    }

    pub fn volt(&self) -> f32 {
        self.udc as f32 / 100.0
    }

    pub fn amp(&self) -> f32 {
        self.idc as f32 / 1000.0
    }
}

/// One five-minute archive slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayData {
    pub datetime: i64,
    pub total_wh: i64,
    pub watt: i64,
}

/// One per-day archive slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonthData {
    pub datetime: i64,
    pub total_wh: i64,
    pub day_wh: i64,
}

/// Everything known about one physical device. Created during discovery,
/// mutated only by the record decoder and the archive consolidation stage.
#[derive(Debug, Clone)]
pub struct Inverter {
    // Identity
    pub susy_id: u16,
    pub serial: u32,
    pub bt_address: BtAddr,
    pub ip_address: Option<Ipv4Addr>,
    pub net_id: u8,
    pub device_class: DeviceClass,
    pub device_class_name: String,
    pub device_name: String,
    pub device_type: String,
    pub sw_version: String,

    // Live AC side (W, cV, mA, cHz)
    pub total_pac: i32,
    pub pac1: i32,
    pub pac2: i32,
    pub pac3: i32,
    pub uac1: i32,
    pub uac2: i32,
    pub uac3: i32,
    pub iac1: i32,
    pub iac2: i32,
    pub iac3: i32,
    pub grid_freq: i32,

    // Live DC side, keyed by tracker index.
    pub mpp: BTreeMap<u8, Mppt>,

    // Accumulators (Wh, seconds)
    pub e_today: i64,
    pub e_total: i64,
    pub operation_time: i64,
    pub feed_in_time: i64,

    // Status tags
    pub device_status: u32,
    pub grid_relay_status: u32,

    // Environment
    pub temperature: i32,
    pub bt_signal: f32,

    // Battery block (valid when has_battery)
    pub has_battery: bool,
    pub bat_cha_stt: u32,
    pub bat_diag_capac_thrp_cnt: u32,
    pub bat_diag_tot_ah_in: u32,
    pub bat_diag_tot_ah_out: u32,
    pub bat_tmp_val: u32,
    pub bat_vol: u32,
    pub bat_amp: i32,

    // Grid metering
    pub metering_grid_ms_tot_w_out: i32,
    pub metering_grid_ms_tot_w_in: i32,

    // Timestamps (Unix epoch, 0 = unknown)
    pub inverter_datetime: i64,
    pub wakeup_time: i64,
    pub sleep_time: i64,

    // Archives
    pub day_data: Box<[DayData; DAY_DATA_LEN]>,
    pub has_day_data: bool,
    pub month_data: [MonthData; MONTH_DATA_LEN],
    pub has_month_data: bool,
    pub month_data_offset: i64,
    pub events: Vec<EventRecord>,

    // Derived spot values
    pub cal_pdc_tot: i32,
    pub cal_pac_tot: i32,
    pub cal_efficiency: f32,

    /// Index of the owning multigate in the roster, for SB-240 children.
    pub multigate_id: Option<usize>,
}

use super::events::EventRecord;

impl Default for Inverter {
    fn default() -> Self {
        let mut mpp = BTreeMap::new();
        // Trackers 1 and 2 exist on every supported inverter; more appear as
        // the decoder sees them.
        mpp.insert(1, Mppt::default());
        mpp.insert(2, Mppt::default());

        Inverter {
            susy_id: 0,
            serial: 0,
            bt_address: BtAddr::ZERO,
            ip_address: None,
            net_id: 0,
            device_class: DeviceClass::default(),
            device_class_name: String::new(),
            device_name: String::new(),
            device_type: String::new(),
            sw_version: String::new(),
            total_pac: 0,
            pac1: 0,
            pac2: 0,
            pac3: 0,
            uac1: 0,
            uac2: 0,
            uac3: 0,
            iac1: 0,
            iac2: 0,
            iac3: 0,
            grid_freq: 0,
            mpp,
            e_today: 0,
            e_total: 0,
            operation_time: 0,
            feed_in_time: 0,
            device_status: 0,
            grid_relay_status: 0,
            temperature: NAN_S32,
            bt_signal: 0.0,
            has_battery: false,
            bat_cha_stt: 0,
            bat_diag_capac_thrp_cnt: 0,
            bat_diag_tot_ah_in: 0,
            bat_diag_tot_ah_out: 0,
            bat_tmp_val: 0,
            bat_vol: 0,
            bat_amp: 0,
            metering_grid_ms_tot_w_out: 0,
            metering_grid_ms_tot_w_in: 0,
            inverter_datetime: 0,
            wakeup_time: 0,
            sleep_time: 0,
            day_data: Box::new([DayData::default(); DAY_DATA_LEN]),
            has_day_data: false,
            month_data: [MonthData::default(); MONTH_DATA_LEN],
            has_month_data: false,
            month_data_offset: 0,
            events: Vec::new(),
            cal_pdc_tot: 0,
            cal_pac_tot: 0,
            cal_efficiency: 0.0,
            multigate_id: None,
        }
    }
}

impl Inverter {
    pub fn is_multigate(&self) -> bool {
        self.susy_id == SID_MULTIGATE
    }

    pub fn is_sb240(&self) -> bool {
        self.susy_id == SID_SB240
    }

    /// Devices that carry no production archive of their own.
    pub fn skip_archive(&self) -> bool {
        self.device_class == DeviceClass::CommunicationProduct || self.is_multigate()
    }

    pub fn reset_day_data(&mut self) {
        self.has_day_data = false;
        for slot in self.day_data.iter_mut() {
            *slot = DayData::default();
        }
    }

    pub fn reset_month_data(&mut self) {
        self.has_month_data = false;
        for slot in self.month_data.iter_mut() {
            *slot = MonthData::default();
        }
    }

    /// Fill in spot values some inverter models do not report: derive power
    /// from voltage and current (`P = U * I`, raw units cV * mA), and the AC
    /// total from the phase sum.
    pub fn calc_missing_spot(&mut self) {
        for mppt in self.mpp.values_mut() {
            if mppt.pdc == 0 {
                mppt.pdc = ((i64::from(mppt.idc) * i64::from(mppt.udc)) / 100_000) as i32;
            }
        }

        if self.pac1 == 0 {
            self.pac1 = ((i64::from(self.iac1) * i64::from(self.uac1)) / 100_000) as i32;
        }
        if self.pac2 == 0 {
            self.pac2 = ((i64::from(self.iac2) * i64::from(self.uac2)) / 100_000) as i32;
        }
        if self.pac3 == 0 {
            self.pac3 = ((i64::from(self.iac3) * i64::from(self.uac3)) / 100_000) as i32;
        }

        if self.total_pac == 0 {
            self.total_pac = self.pac1 + self.pac2 + self.pac3;
        }
    }

    /// Derived totals reported alongside the spot snapshot.
    pub fn update_derived_spot(&mut self) {
        self.cal_pdc_tot = self.mpp.values().map(|m| m.pdc).sum();
        self.cal_pac_tot = self.pac1 + self.pac2 + self.pac3;
        self.cal_efficiency = if self.cal_pdc_tot == 0 {
            0.0
        } else {
            100.0 * self.cal_pac_tot as f32 / self.cal_pdc_tot as f32
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_from_attribute() {
        assert_eq!(DeviceClass::from_repr(8001), Some(DeviceClass::SolarInverter));
        assert_eq!(DeviceClass::from_repr(8128), Some(DeviceClass::CommunicationProduct));
        assert_eq!(DeviceClass::from_repr(1234), None);
    }

    #[test]
    fn calc_missing_spot_derives_power() {
        let mut inv = Inverter::default();
        inv.uac1 = 23000; // 230.00 V
        inv.iac1 = 4348; // 4.348 A
        inv.mpp.get_mut(&1).unwrap().udc = 40000; // 400.00 V
        inv.mpp.get_mut(&1).unwrap().idc = 2500; // 2.500 A
        inv.calc_missing_spot();

        assert_eq!(inv.pac1, 23000 * 4348 / 100_000);
        assert_eq!(inv.mpp[&1].pdc, 40000 * 2500 / 100_000);
        assert_eq!(inv.total_pac, inv.pac1 + inv.pac2 + inv.pac3);
    }

    #[test]
    fn calc_missing_spot_keeps_reported_values() {
        let mut inv = Inverter::default();
        inv.pac1 = 1500;
        inv.uac1 = 23000;
        inv.iac1 = 9999;
        inv.total_pac = 4500;
        inv.calc_missing_spot();
        assert_eq!(inv.pac1, 1500);
        assert_eq!(inv.total_pac, 4500);
    }

    #[test]
    fn efficiency_guards_division_by_zero() {
        let mut inv = Inverter::default();
        inv.update_derived_spot();
        assert_eq!(inv.cal_efficiency, 0.0);
    }
}
