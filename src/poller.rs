//! The polling cycle and the daemon loop.
//!
//! One cycle runs strictly sequentially: connect, discover, log on, live
//! queries, archives, export, log off. In daemon mode cycles repeat on the
//! configured interval; a shutdown signal is observed between cycles, never
//! in the middle of one.

use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::archive::EventSweep;
use crate::config::{AppConfig, ConnectionKind};
use crate::domain::{DeviceClass, UserGroup};
use crate::engine::Query;
use crate::error::{Result, SmaError};
use crate::export::Exporter;
use crate::protocol::{LinkKind, SID_MULTIGATE};
use crate::session::Session;
use crate::tags::TagCatalog;
use crate::telemetry;
use crate::transport::speedwire::SpeedwireLink;
use crate::transport::Transport;

/// SB 3600-SE (Smart Energy): carries a battery without a battery device
/// class.
const SID_SMART_ENERGY: u16 = 292;

pub struct Poller {
    cfg: AppConfig,
    exporter: Box<dyn Exporter>,
}

impl Poller {
    pub fn new(cfg: AppConfig, exporter: Box<dyn Exporter>) -> Poller {
        Poller { cfg, exporter }
    }

    /// Run once or loop as a daemon, per configuration.
    pub async fn run(&mut self) -> Result<()> {
        if !self.cfg.poll.daemon {
            return self.run_cycle().await;
        }

        let interval = std::time::Duration::from_secs(self.cfg.poll.interval_secs);
        loop {
            if let Err(err) = self.run_cycle().await {
                // A daemon never exits on a single bad cycle.
                error!(%err, "polling cycle failed");
            }
            info!(secs = interval.as_secs(), "sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = telemetry::shutdown_signal() => {
                    info!("stop requested, exiting daemon loop");
                    return Ok(());
                }
            }
        }
    }

    async fn connect(&self) -> Result<Box<dyn Transport>> {
        match self.cfg.connection.kind {
            ConnectionKind::Speedwire => {
                info!("connecting to local network");
                let link = SpeedwireLink::connect(self.cfg.connection.port).await?;
                Ok(Box::new(link))
            }
            #[cfg(all(feature = "bluetooth", target_os = "linux"))]
            ConnectionKind::Bluetooth => {
                let addr = self.cfg.connection.bt_addr()?;
                info!(%addr, "connecting to inverter");
                let link = crate::transport::bluetooth::BluetoothLink::connect(
                    addr,
                    self.cfg.connection.bt_connect_retries,
                )
                .await?;
                Ok(Box::new(link))
            }
            #[cfg(not(all(feature = "bluetooth", target_os = "linux")))]
            ConnectionKind::Bluetooth => Err(SmaError::Init(
                "bluetooth support is not compiled into this build".into(),
            )),
            ConnectionKind::None => Err(SmaError::BadArg(
                "no connection configured; set a BT address or IP list".into(),
            )),
        }
    }

    /// One full polling cycle.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let tz = self.cfg.session.tz()?;
        let group = self.cfg.session.user_group;
        let tags = TagCatalog::load(&self.cfg.tags.dir, &self.cfg.tags.locale)
            .map_err(|e| SmaError::Init(format!("loading tag catalogue: {e:#}")))?;

        let transport = self.connect().await?;
        let timeout = self.cfg.connection.recv_timeout(transport.kind());
        let mut session = Session::new(transport, tags, timeout);

        session
            .initialise(
                self.cfg.connection.bt_addr().ok(),
                &self.cfg.connection.parsed_ips()?,
                self.cfg.session.multi_inverter,
            )
            .await?;

        if let Err(err) = session.logon(group, &self.cfg.session.password).await {
            error!("Logon failed. Check '{}' Password", group.as_str());
            let _ = session.logoff().await;
            return Err(err);
        }
        info!("logon OK");

        if session.kind() == LinkKind::Bluetooth {
            match session.bt_signal_strength(0).await {
                Ok(signal) => info!(signal = format_args!("{signal:.1}%"), "BT link quality"),
                Err(err) => warn!(%err, "BT signal query failed"),
            }

            let sync = &self.cfg.time_sync;
            if sync.every_days > 0 {
                if let Err(err) = session
                    .sync_plant_time(
                        i64::from(sync.every_days),
                        i64::from(sync.low_limit_secs),
                        i64::from(sync.high_limit_secs),
                    )
                    .await
                {
                    warn!(%err, "plant time synchronization failed");
                }
            }
        }

        self.query_live(&mut session, group).await?;

        if let Err(err) = self.exporter.export_spot(&session.roster, &session.tags).await {
            warn!(%err, "spot export failed");
        }

        self.query_archives(&mut session, group, tz).await?;

        if session.kind() == LinkKind::Speedwire {
            let _ = session.logoff_multigate_children().await;
        }
        session.logoff().await?;
        info!("cycle complete");
        Ok(())
    }

    /// The live query ladder; per-query failures are logged and the cycle
    /// continues with the remaining queries and devices.
    async fn query_live(&mut self, session: &mut Session, group: UserGroup) -> Result<()> {
        fetch_logged(session, Query::SoftwareVersion).await;
        fetch_logged(session, Query::TypeLabel).await;

        for inv in &mut session.roster {
            inv.has_battery = matches!(
                inv.device_class,
                DeviceClass::BatteryInverter | DeviceClass::HybridInverter
            ) || inv.susy_id == SID_SMART_ENERGY;
            if inv.has_battery {
                info!(susy_id = inv.susy_id, serial = inv.serial, "battery device");
                session.has_battery_device = true;
            }
            info!(
                susy_id = inv.susy_id,
                serial = inv.serial,
                name = %inv.device_name,
                class = %inv.device_class_name,
                device_type = %inv.device_type,
                sw_version = %inv.sw_version,
                "device"
            );
        }

        // A multigate fronts its SB-240 micro-inverters; pull the child list
        // and bring the children into the session.
        let multigates: Vec<usize> = session
            .roster
            .iter()
            .enumerate()
            .filter(|(_, inv)| {
                inv.device_class == DeviceClass::CommunicationProduct
                    && inv.susy_id == SID_MULTIGATE
            })
            .map(|(idx, _)| idx)
            .collect();
        for mg in multigates {
            info!(multigate = mg, "multigate found, reading device list");
            session.roster[mg].multigate_id = Some(mg);
            match session.fetch_device_list(mg).await {
                Ok(()) => {
                    if let Err(err) = session.logon(group, &self.cfg.session.password).await {
                        error!("Logon failed. Check '{}' Password", group.as_str());
                        return Err(err);
                    }
                    fetch_logged(session, Query::SoftwareVersion).await;
                    fetch_logged(session, Query::TypeLabel).await;
                }
                Err(err) => warn!(%err, "multigate device list failed"),
            }
        }

        if session.has_battery_device {
            fetch_logged(session, Query::BatteryChargeStatus).await;
            fetch_logged(session, Query::BatteryInfo).await;
        }

        fetch_logged(session, Query::MeteringGridMsTotW).await;
        fetch_logged(session, Query::DeviceStatus).await;
        fetch_logged(session, Query::InverterTemperature).await;

        if session
            .roster
            .first()
            .map(|inv| inv.device_class == DeviceClass::SolarInverter)
            .unwrap_or(false)
        {
            fetch_logged(session, Query::GridRelayStatus).await;
        }

        fetch_logged(session, Query::EnergyProduction).await;
        fetch_logged(session, Query::OperationTime).await;
        fetch_logged(session, Query::SpotDcPower).await;
        fetch_logged(session, Query::SpotDcVoltage).await;
        fetch_logged(session, Query::SpotAcPower).await;
        fetch_logged(session, Query::SpotAcVoltage).await;
        fetch_logged(session, Query::SpotAcTotalPower).await;
        fetch_logged(session, Query::SpotGridFrequency).await;

        // Some models report a zero day counter while the total keeps
        // counting; reconstruct it from the first day-archive slot.
        let tz = self.cfg.session.tz()?;
        let needs_fallback = session
            .roster
            .iter()
            .any(|inv| inv.e_today == 0 && inv.e_total != 0);
        if needs_fallback {
            let now = Utc::now().timestamp();
            match session.archive_day_data(now, tz).await {
                Ok(()) => {
                    for inv in &mut session.roster {
                        if inv.e_today == 0
                            && inv.e_total != 0
                            && inv.day_data[0].total_wh != 0
                        {
                            inv.e_today = inv.e_total - inv.day_data[0].total_wh;
                            info!(
                                serial = inv.serial,
                                e_today = inv.e_today,
                                "day yield reconstructed from archive"
                            );
                        }
                    }
                }
                Err(SmaError::ArchiveNoData) => {}
                Err(err) => warn!(%err, "day archive for yield fallback failed"),
            }
        }

        for inv in &mut session.roster {
            if self.cfg.poll.calc_missing_spot {
                inv.calc_missing_spot();
            }
            inv.update_derived_spot();
        }

        Ok(())
    }

    async fn query_archives(
        &mut self,
        session: &mut Session,
        group: UserGroup,
        tz: Tz,
    ) -> Result<()> {
        let start = self
            .cfg
            .archive
            .start_date_epoch(tz)?
            .unwrap_or_else(|| Utc::now().timestamp());

        // Day archives, newest first.
        let mut arch_time = start;
        for _ in 0..self.cfg.archive.days {
            match session.archive_day_data(arch_time, tz).await {
                Ok(()) => {
                    if let Err(err) = self.exporter.export_day(&session.roster).await {
                        warn!(%err, "day export failed");
                    }
                }
                Err(SmaError::ArchiveNoData) => {}
                Err(err) => warn!(%err, "day archive failed"),
            }
            arch_time -= 86_400;
        }

        // Month archives, newest first. On the 1st of the month a single
        // month window would miss the previous month's closing record, so
        // widen it to two.
        let mut months = self.cfg.archive.months;
        if months == 1 && Utc::now().with_timezone(&tz).day() == 1 {
            months = 2;
        }
        if months > 0 {
            if let Err(err) = session.detect_month_data_offset(tz).await {
                warn!(%err, "month offset detection failed");
            }
            let start_utc = chrono::DateTime::<Utc>::from_timestamp(start, 0)
                .unwrap_or_else(Utc::now);
            let (mut year, mut month) = (start_utc.year(), start_utc.month());
            for _ in 0..months {
                match session.archive_month_data(year, month, tz).await {
                    Ok(()) => {
                        if let Err(err) = self.exporter.export_month(&session.roster).await {
                            warn!(%err, "month export failed");
                        }
                    }
                    Err(err) => warn!(%err, "month archive failed"),
                }
                (year, month) = previous_month(year, month);
            }
        }

        // Event archives, newest month first, stopping at the oldest entry.
        if self.cfg.archive.event_months > 0 {
            let start_utc = chrono::DateTime::<Utc>::from_timestamp(start, 0)
                .unwrap_or_else(Utc::now);
            let newest = (start_utc.year(), start_utc.month());
            let (mut year, mut month) = newest;
            let mut oldest = newest;

            'months: for _ in 0..self.cfg.archive.event_months {
                oldest = (year, month);
                match session.archive_event_data(year, month, UserGroup::User).await {
                    Ok(EventSweep::EndOfLog) => break 'months,
                    Ok(EventSweep::More) => {}
                    Err(err) => warn!(%err, "event archive failed"),
                }
                if group == UserGroup::Installer {
                    match session
                        .archive_event_data(year, month, UserGroup::Installer)
                        .await
                    {
                        Ok(EventSweep::EndOfLog) => break 'months,
                        Ok(EventSweep::More) => {}
                        Err(err) => warn!(%err, "event archive failed"),
                    }
                }
                (year, month) = previous_month(year, month);
            }

            let range = format!(
                "{:04}{:02}-{:04}{:02}",
                oldest.0, oldest.1, newest.0, newest.1
            );
            if let Err(err) = self
                .exporter
                .export_events(&session.roster, &session.tags, &range)
                .await
            {
                warn!(%err, "event export failed");
            }
        }

        Ok(())
    }
}

async fn fetch_logged(session: &mut Session, query: Query) {
    match session.fetch_data(query).await {
        Ok(()) => {}
        // An LRI a device does not implement is expected plant diversity.
        Err(SmaError::LriNotAvailable) => {}
        Err(err) => warn!(query = query.name(), %err, "query failed"),
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_month_wraps_the_year() {
        assert_eq!(previous_month(2024, 1), (2023, 12));
        assert_eq!(previous_month(2024, 7), (2024, 6));
    }
}
