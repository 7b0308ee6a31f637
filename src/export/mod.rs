//! Interface to downstream sinks.
//!
//! Sinks (CSV files, SQL databases, MQTT brokers, uploaders) live outside
//! this crate; they receive read-only snapshots of the decoded state after
//! each polling stage. The built-in exporter serializes the snapshots as
//! JSON lines through the log so a plant can run without any sink attached.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::domain::{EventRecord, Inverter};
use crate::tags::TagCatalog;

/// Live state snapshot handed to sinks after the spot queries.
#[derive(Debug, Clone, Serialize)]
pub struct SpotSnapshot {
    pub susy_id: u16,
    pub serial: u32,
    pub device_name: String,
    pub device_type: String,
    pub device_class: String,
    pub sw_version: String,
    pub inverter_datetime: i64,
    pub total_pac: i32,
    pub pac: [i32; 3],
    pub uac: [i32; 3],
    pub iac: [i32; 3],
    pub grid_freq: i32,
    pub mpp: Vec<MpptSnapshot>,
    pub e_today: i64,
    pub e_total: i64,
    pub operation_time: i64,
    pub feed_in_time: i64,
    pub device_status: u32,
    pub grid_relay_status: u32,
    pub temperature: i32,
    pub bt_signal: f32,
    pub battery: Option<BatterySnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MpptSnapshot {
    pub tracker: u8,
    pub pdc: i32,
    pub udc: i32,
    pub idc: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatterySnapshot {
    pub soc: u32,
    pub temperature: u32,
    pub voltage: u32,
    pub current: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaySnapshot {
    pub serial: u32,
    pub datetime: i64,
    pub total_wh: i64,
    pub watt: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthSnapshot {
    pub serial: u32,
    pub datetime: i64,
    pub total_wh: i64,
    pub day_wh: i64,
}

/// Event shape handed to sinks; tag ids are resolved to localized text.
#[derive(Debug, Clone, Serialize)]
pub struct EventSnapshot {
    pub entry_id: u16,
    pub datetime: i64,
    pub susy_id: u16,
    pub serial: u32,
    pub event_code: u16,
    pub event_type: String,
    pub event_category: String,
    pub group: String,
    pub description: String,
    pub old_value: u32,
    pub new_value: u32,
    pub user_group: String,
}

impl SpotSnapshot {
    pub fn of(inv: &Inverter) -> SpotSnapshot {
        SpotSnapshot {
            susy_id: inv.susy_id,
            serial: inv.serial,
            device_name: inv.device_name.clone(),
            device_type: inv.device_type.clone(),
            device_class: inv.device_class_name.clone(),
            sw_version: inv.sw_version.clone(),
            inverter_datetime: inv.inverter_datetime,
            total_pac: inv.total_pac,
            pac: [inv.pac1, inv.pac2, inv.pac3],
            uac: [inv.uac1, inv.uac2, inv.uac3],
            iac: [inv.iac1, inv.iac2, inv.iac3],
            grid_freq: inv.grid_freq,
            mpp: inv
                .mpp
                .iter()
                .map(|(tracker, m)| MpptSnapshot {
                    tracker: *tracker,
                    pdc: m.pdc,
                    udc: m.udc,
                    idc: m.idc,
                })
                .collect(),
            e_today: inv.e_today,
            e_total: inv.e_total,
            operation_time: inv.operation_time,
            feed_in_time: inv.feed_in_time,
            device_status: inv.device_status,
            grid_relay_status: inv.grid_relay_status,
            temperature: inv.temperature,
            bt_signal: inv.bt_signal,
            battery: inv.has_battery.then(|| BatterySnapshot {
                soc: inv.bat_cha_stt,
                temperature: inv.bat_tmp_val,
                voltage: inv.bat_vol,
                current: inv.bat_amp,
            }),
        }
    }
}

impl EventSnapshot {
    pub fn of(event: &EventRecord, tags: &TagCatalog) -> EventSnapshot {
        EventSnapshot {
            entry_id: event.entry_id,
            datetime: event.datetime,
            susy_id: event.susy_id,
            serial: event.serial,
            event_code: event.event_code,
            event_type: event.event_type().to_string(),
            event_category: event.event_category().to_string(),
            group: tags.description_or(event.group_tag_id(), "?").to_string(),
            description: event.description(tags),
            old_value: event.old_value(),
            new_value: event.new_value(),
            user_group: tags
                .description_or(event.user_group_tag_id(), event.user_group.as_str())
                .to_string(),
        }
    }
}

/// Sink contract: one hook per polling stage.
#[async_trait]
pub trait Exporter: Send {
    async fn export_spot(&mut self, roster: &[Inverter], tags: &TagCatalog) -> anyhow::Result<()>;
    async fn export_day(&mut self, roster: &[Inverter]) -> anyhow::Result<()>;
    async fn export_month(&mut self, roster: &[Inverter]) -> anyhow::Result<()>;
    async fn export_events(
        &mut self,
        roster: &[Inverter],
        tags: &TagCatalog,
        range: &str,
    ) -> anyhow::Result<()>;
}

/// Default sink: JSON lines through the log stream.
#[derive(Debug, Default)]
pub struct JsonLogExporter;

#[async_trait]
impl Exporter for JsonLogExporter {
    async fn export_spot(&mut self, roster: &[Inverter], _tags: &TagCatalog) -> anyhow::Result<()> {
        for inv in roster {
            let json = serde_json::to_string(&SpotSnapshot::of(inv))?;
            info!(target: "sunwire::export", kind = "spot", data = %json);
        }
        Ok(())
    }

    async fn export_day(&mut self, roster: &[Inverter]) -> anyhow::Result<()> {
        for inv in roster.iter().filter(|inv| inv.has_day_data) {
            for slot in inv.day_data.iter().filter(|slot| slot.datetime != 0) {
                let json = serde_json::to_string(&DaySnapshot {
                    serial: inv.serial,
                    datetime: slot.datetime,
                    total_wh: slot.total_wh,
                    watt: slot.watt,
                })?;
                info!(target: "sunwire::export", kind = "day", data = %json);
            }
        }
        Ok(())
    }

    async fn export_month(&mut self, roster: &[Inverter]) -> anyhow::Result<()> {
        for inv in roster.iter().filter(|inv| inv.has_month_data) {
            for slot in inv.month_data.iter().filter(|slot| slot.datetime != 0) {
                let json = serde_json::to_string(&MonthSnapshot {
                    serial: inv.serial,
                    datetime: slot.datetime,
                    total_wh: slot.total_wh,
                    day_wh: slot.day_wh,
                })?;
                info!(target: "sunwire::export", kind = "month", data = %json);
            }
        }
        Ok(())
    }

    async fn export_events(
        &mut self,
        roster: &[Inverter],
        tags: &TagCatalog,
        range: &str,
    ) -> anyhow::Result<()> {
        for inv in roster {
            // Highest entry id first, like the on-device display.
            for event in inv.events.iter().rev() {
                let json = serde_json::to_string(&EventSnapshot::of(event, tags))?;
                info!(target: "sunwire::export", kind = "event", range, data = %json);
            }
        }
        Ok(())
    }
}
