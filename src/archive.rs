//! Historical archives: 5-minute day data, per-day month data, event log.
//!
//! Archive replies carry 12-byte `(datetime, total_wh)` records. Inverters
//! occasionally send corrupted, duplicated or future records; every sample
//! has to pass the validation gate before it lands in a slot, and the
//! previous-sample state only advances on valid records.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::domain::events::EVENT_RECORD_LEN;
use crate::domain::{EventRecord, Inverter, UserGroup, DAY_DATA_LEN, MONTH_DATA_LEN};
use crate::error::{Result, SmaError};
use crate::protocol::nan::{is_nan_u64, NAN_U64};
use crate::protocol::{BtAddr, LinkKind, MAX_RETRY};
use crate::session::Session;

const DAY_ARCHIVE_CMD: u32 = 0x7000_0200;
const MONTH_ARCHIVE_CMD: u32 = 0x7020_0200;
const EVENT_ARCHIVE_USER_CMD: u32 = 0x7010_0200;
const EVENT_ARCHIVE_INSTALLER_CMD: u32 = 0x7012_0200;

/// Wire size of one `(datetime u32, total_wh u64)` sample.
const ARCHIVE_RECORD_LEN: usize = 12;

/// Result of one event sweep over the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSweep {
    /// Older months may hold more events.
    More,
    /// The oldest log entry was reached; stop going further back.
    EndOfLog,
}

/// Local midnight of the civil day containing `ts`. When the day starts
/// inside a DST gap, the first existing hour counts as the day start.
pub fn civil_day_start(ts: i64, tz: Tz) -> Option<i64> {
    let day = DateTime::<Utc>::from_timestamp(ts, 0)?
        .with_timezone(&tz)
        .date_naive();
    local_day_start(day, tz)
}

pub fn local_day_start(day: NaiveDate, tz: Tz) -> Option<i64> {
    for hour in 0..3 {
        if let Some(dt) = tz
            .from_local_datetime(&day.and_hms_opt(hour, 0, 0)?)
            .earliest()
        {
            return Some(dt.timestamp());
        }
    }
    None
}

/// Day-archive accumulator: the previously accepted sample. Only valid
/// records advance it.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DayAccum {
    prev_datetime: i64,
    prev_total_wh: u64,
}

/// Validate one day-archive sample and store it when it belongs to `day`.
/// Slot index is `hour * 12 + minute / 5` in local time; the stored power is
/// the trailing average since the previous sample.
pub(crate) fn apply_day_record(
    dev: &mut Inverter,
    day: NaiveDate,
    tz: Tz,
    accum: &mut DayAccum,
    datetime: i64,
    total_wh: u64,
) {
    let invalid = is_nan_u64(total_wh)
        || datetime <= accum.prev_datetime
        || datetime % 300 != 0
        || total_wh < accum.prev_total_wh;
    if invalid {
        return;
    }

    if accum.prev_total_wh != 0 {
        if let Some(local) = DateTime::<Utc>::from_timestamp(datetime, 0)
            .map(|dt| dt.with_timezone(&tz))
        {
            if local.date_naive() == day {
                let idx = (local.hour() * 12 + local.minute() / 5) as usize;
                if idx < DAY_DATA_LEN {
                    dev.day_data[idx].datetime = datetime;
                    dev.day_data[idx].total_wh = total_wh as i64;
                    // Intervals are not always five minutes; average over
                    // the actual span.
                    dev.day_data[idx].watt = ((total_wh - accum.prev_total_wh) * 3600
                        / (datetime - accum.prev_datetime) as u64)
                        as i64;
                    dev.has_day_data = true;
                }
            }
        }
    }

    accum.prev_datetime = datetime;
    accum.prev_total_wh = total_wh;
}

/// Month-archive accumulator.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MonthAccum {
    prev_total_wh: u64,
    idx: usize,
}

/// Validate one month-archive sample and store it when its UTC month matches
/// the requested one.
pub(crate) fn apply_month_record(
    dev: &mut Inverter,
    month: u32,
    accum: &mut MonthAccum,
    datetime: i64,
    total_wh: u64,
) {
    if total_wh == NAN_U64 {
        return;
    }
    if accum.prev_total_wh != 0 {
        if let Some(utc) = DateTime::<Utc>::from_timestamp(datetime, 0) {
            if utc.month() == month && accum.idx < MONTH_DATA_LEN {
                dev.has_month_data = true;
                dev.month_data[accum.idx].datetime = datetime;
                dev.month_data[accum.idx].total_wh = total_wh as i64;
                dev.month_data[accum.idx].day_wh = (total_wh - accum.prev_total_wh) as i64;
                accum.idx += 1;
            }
        }
    }
    accum.prev_total_wh = total_wh;
}

/// Sum SB-240 children into their multigate's day slots.
pub fn consolidate_day(roster: &mut [Inverter]) {
    for mg in 0..roster.len() {
        if !roster[mg].is_multigate() {
            continue;
        }
        roster[mg].has_day_data = true;
        for child in 0..roster.len() {
            if !(roster[child].is_sb240() && roster[child].multigate_id == Some(mg)) {
                continue;
            }
            let child_data = roster[child].day_data.clone();
            for (slot, cslot) in roster[mg].day_data.iter_mut().zip(child_data.iter()) {
                slot.datetime = cslot.datetime;
                slot.total_wh += cslot.total_wh;
                slot.watt += cslot.watt;
            }
        }
    }
}

/// Sum SB-240 children into their multigate's month slots.
pub fn consolidate_month(roster: &mut [Inverter]) {
    for mg in 0..roster.len() {
        if !roster[mg].is_multigate() {
            continue;
        }
        roster[mg].has_month_data = true;
        for child in 0..roster.len() {
            if !(roster[child].is_sb240() && roster[child].multigate_id == Some(mg)) {
                continue;
            }
            let child_data = roster[child].month_data;
            for (slot, cslot) in roster[mg].month_data.iter_mut().zip(child_data.iter()) {
                slot.datetime = cslot.datetime;
                slot.total_wh += cslot.total_wh;
                slot.day_wh += cslot.day_wh;
            }
        }
    }
}

fn days_in_month(year: i32, month: u32) -> i64 {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first, next) {
        (Some(first), Some(next)) => (next - first).num_days(),
        _ => 30,
    }
}

impl Session {
    /// Retrieve the 5-minute archive of the civil day containing
    /// `start_time` for every device, then consolidate multigates.
    ///
    /// `ArchiveNoData` means no device had samples for the window; that is a
    /// data condition, not a link failure.
    pub async fn archive_day_data(&mut self, start_time: i64, tz: Tz) -> Result<()> {
        let day_start = civil_day_start(start_time, tz)
            .ok_or_else(|| SmaError::BadArg("unrepresentable archive day".into()))?;
        let day = DateTime::<Utc>::from_timestamp(day_start, 0)
            .map(|dt| dt.with_timezone(&tz).date_naive())
            .ok_or_else(|| SmaError::BadArg("unrepresentable archive day".into()))?;
        info!(%day, "reading day archive");

        let mut has_multigate = false;
        for inv in &mut self.roster {
            has_multigate |= inv.is_multigate();
            inv.reset_day_data();
        }

        let mut has_data = false;
        for idx in 0..self.roster.len() {
            if self.roster[idx].skip_archive() {
                continue;
            }
            self.fetch_day_archive(idx, day_start, day, tz, &mut has_data)
                .await?;
        }

        if has_multigate {
            debug!("consolidating micro-inverter day data into multigates");
            consolidate_day(&mut self.roster);
        }

        if has_data {
            Ok(())
        } else {
            Err(SmaError::ArchiveNoData)
        }
    }

    async fn fetch_day_archive(
        &mut self,
        idx: usize,
        day_start: i64,
        day: NaiveDate,
        tz: Tz,
        has_data: &mut bool,
    ) -> Result<()> {
        let (susy_id, serial, bt_address) = {
            let dev = &self.roster[idx];
            (dev.susy_id, dev.serial, dev.bt_address)
        };
        let expect = match self.kind() {
            LinkKind::Bluetooth => bt_address,
            LinkKind::Speedwire => BtAddr::UNKNOWN,
        };

        let mut retries = MAX_RETRY;
        'retry: loop {
            let (frame, packet_id) =
                self.build_request(bt_address, 0x09, 0xE0, 0, susy_id, serial, |b| {
                    b.write_u32(DAY_ARCHIVE_CMD);
                    b.write_u32((day_start - 300) as u32);
                    b.write_u32((day_start + 86_100) as u32);
                })?;
            self.send_to_device(&frame, idx).await?;

            let mut accum = DayAccum::default();
            let mut synced = false;
            loop {
                let (reply, _) = match self.recv_l2(expect).await {
                    Err(SmaError::NoData) if retries > 1 => {
                        retries -= 1;
                        debug!(device = idx, "day archive timeout, retrying");
                        continue 'retry;
                    }
                    other => other?,
                };

                let fragments = reply.fragment_count()?;
                if !synced && reply.packet_id()? != packet_id {
                    // A stray reply means the sequence is lost; treat it as
                    // complete rather than mixing days.
                    debug!(
                        expected = packet_id,
                        received = reply.packet_id()?,
                        "packet id mismatch, closing day sequence"
                    );
                    return Ok(());
                }
                synced = true;

                for rec in reply.records(ARCHIVE_RECORD_LEN) {
                    *has_data = true;
                    let datetime = i64::from(LittleEndian::read_u32(&rec[0..4]));
                    let total_wh = LittleEndian::read_u64(&rec[4..12]);
                    apply_day_record(&mut self.roster[idx], day, tz, &mut accum, datetime, total_wh);
                }

                if fragments == 0 {
                    return Ok(());
                }
            }
        }
    }

    /// Retrieve the per-day archive of `month`/`year` (local 1st, 12:00) for
    /// every device, honoring each device's month-data offset quirk.
    pub async fn archive_month_data(&mut self, year: i32, month: u32, tz: Tz) -> Result<()> {
        let noon = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .and_then(|dt| tz.from_local_datetime(&dt).earliest())
            .ok_or_else(|| SmaError::BadArg("unrepresentable archive month".into()))?
            .timestamp();
        info!(year, month, "reading month archive");

        let mut has_multigate = false;
        for inv in &mut self.roster {
            has_multigate |= inv.is_multigate();
            inv.reset_month_data();
        }

        for idx in 0..self.roster.len() {
            if self.roster[idx].skip_archive() {
                continue;
            }
            self.fetch_month_archive(idx, noon, month).await?;
        }

        if has_multigate {
            debug!("consolidating micro-inverter month data into multigates");
            consolidate_month(&mut self.roster);
        }
        Ok(())
    }

    async fn fetch_month_archive(&mut self, idx: usize, noon: i64, month: u32) -> Result<()> {
        let (susy_id, serial, bt_address, offset) = {
            let dev = &self.roster[idx];
            (dev.susy_id, dev.serial, dev.bt_address, dev.month_data_offset)
        };
        let expect = match self.kind() {
            LinkKind::Bluetooth => bt_address,
            LinkKind::Speedwire => BtAddr::UNKNOWN,
        };
        let window_end = noon + 86_400 * (MONTH_DATA_LEN as i64 + 1);

        let mut retries = MAX_RETRY;
        'retry: loop {
            let (frame, packet_id) =
                self.build_request(bt_address, 0x09, 0xE0, 0, susy_id, serial, |b| {
                    b.write_u32(MONTH_ARCHIVE_CMD);
                    b.write_u32((noon - 2 * 86_400) as u32);
                    b.write_u32(window_end as u32);
                })?;
            self.send_to_device(&frame, idx).await?;

            let mut accum = MonthAccum::default();
            let mut synced = false;
            loop {
                let (reply, _) = match self.recv_l2(expect).await {
                    Err(SmaError::NoData) if retries > 1 => {
                        retries -= 1;
                        debug!(device = idx, "month archive timeout, retrying");
                        continue 'retry;
                    }
                    other => other?,
                };

                let fragments = reply.fragment_count()?;
                if !synced && reply.packet_id()? != packet_id {
                    debug!(
                        expected = packet_id,
                        received = reply.packet_id()?,
                        "packet id mismatch, rereading"
                    );
                    accum = MonthAccum::default();
                    continue;
                }
                synced = true;

                for rec in reply.records(ARCHIVE_RECORD_LEN) {
                    let datetime = i64::from(LittleEndian::read_u32(&rec[0..4])) + offset;
                    let total_wh = LittleEndian::read_u64(&rec[4..12]);
                    apply_month_record(&mut self.roster[idx], month, &mut accum, datetime, total_wh);
                }

                if fragments == 0 {
                    return Ok(());
                }
            }
        }
    }

    /// Pre-pass detecting inverters that report month records one day late:
    /// run the current month and check whether the last populated record
    /// already carries today's UTC day.
    pub async fn detect_month_data_offset(&mut self, tz: Tz) -> Result<()> {
        let now = Utc::now();
        self.archive_month_data(now.year(), now.month(), tz).await?;

        for inv in &mut self.roster {
            inv.month_data_offset = 0;
            if !inv.has_month_data {
                continue;
            }
            if let Some(last) = inv
                .month_data
                .iter()
                .rev()
                .find(|slot| slot.datetime != 0)
            {
                let last_day = DateTime::<Utc>::from_timestamp(last.datetime, 0)
                    .map(|dt| dt.ordinal());
                if last_day == Some(now.ordinal()) {
                    inv.month_data_offset = -86_400;
                }
            }
            debug!(
                susy_id = inv.susy_id,
                serial = inv.serial,
                offset = inv.month_data_offset,
                "month data offset"
            );
        }
        Ok(())
    }

    /// Sweep the event log of one UTC month for every device. Entry id 1
    /// marks the oldest record; the sweep reports it so the caller stops
    /// requesting older months.
    pub async fn archive_event_data(
        &mut self,
        year: i32,
        month: u32,
        group: UserGroup,
    ) -> Result<EventSweep> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| SmaError::BadArg("unrepresentable event month".into()))?;
        let end = start + 86_400 * days_in_month(year, month);
        let command = match group {
            UserGroup::User => EVENT_ARCHIVE_USER_CMD,
            UserGroup::Installer => EVENT_ARCHIVE_INSTALLER_CMD,
        };
        info!(year, month, group = group.as_str(), "reading event archive");

        let mut sweep = EventSweep::More;
        for idx in 0..self.roster.len() {
            if self.fetch_event_archive(idx, command, start, end, group).await? == EventSweep::EndOfLog {
                sweep = EventSweep::EndOfLog;
            }
        }
        Ok(sweep)
    }

    async fn fetch_event_archive(
        &mut self,
        idx: usize,
        command: u32,
        start: i64,
        end: i64,
        group: UserGroup,
    ) -> Result<EventSweep> {
        let (susy_id, serial, bt_address) = {
            let dev = &self.roster[idx];
            (dev.susy_id, dev.serial, dev.bt_address)
        };
        let expect = match self.kind() {
            LinkKind::Bluetooth => bt_address,
            LinkKind::Speedwire => BtAddr::UNKNOWN,
        };

        let mut retries = MAX_RETRY;
        'retry: loop {
            let (frame, packet_id) =
                self.build_request(bt_address, 0x09, 0xE0, 0, susy_id, serial, |b| {
                    b.write_u32(command);
                    b.write_u32(start as u32);
                    b.write_u32(end as u32);
                })?;
            self.send_to_device(&frame, idx).await?;

            let mut synced = false;
            let mut oldest_reached = false;
            loop {
                let (reply, _) = match self.recv_l2(expect).await {
                    Err(SmaError::NoData) if retries > 1 => {
                        retries -= 1;
                        debug!(device = idx, "event archive timeout, retrying");
                        continue 'retry;
                    }
                    other => other?,
                };

                let fragments = reply.fragment_count()?;
                if !synced && reply.packet_id()? != packet_id {
                    debug!(
                        expected = packet_id,
                        received = reply.packet_id()?,
                        "packet id mismatch, rereading"
                    );
                    continue;
                }
                synced = true;

                for rec in reply.records(EVENT_RECORD_LEN) {
                    if let Some(event) = EventRecord::parse(rec, group)? {
                        oldest_reached |= event.is_end_of_log();
                        self.roster[idx].events.push(event);
                    }
                }

                if fragments == 0 {
                    return Ok(if oldest_reached {
                        EventSweep::EndOfLog
                    } else {
                        EventSweep::More
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Brussels;

    #[test]
    fn day_filter_accepts_only_valid_records() {
        let tz = Brussels;
        // 2024-06-15 local day.
        let day_start = local_day_start(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(), tz).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();

        let mut dev = Inverter::default();
        let mut accum = DayAccum::default();

        let records = [
            (day_start + 300, 1000),    // seeds prev, not stored
            (day_start + 600, 1010),    // stored
            (day_start + 600, 1020),    // duplicate timestamp, dropped
            (day_start + 750, 1030),    // not a 300s boundary, dropped
            (day_start + 900, NAN_U64), // NaN, dropped
            (day_start + 900, 1005),    // counter went backwards, dropped
            (day_start + 900, 1030),    // stored
        ];
        for (dt, wh) in records {
            apply_day_record(&mut dev, day, tz, &mut accum, dt, wh);
        }

        assert!(dev.has_day_data);
        let filled: Vec<_> = dev
            .day_data
            .iter()
            .enumerate()
            .filter(|(_, s)| s.datetime != 0)
            .collect();
        assert_eq!(filled.len(), 2);
        // Slot of 00:10 local.
        assert_eq!(filled[0].0, 2);
        assert_eq!(filled[0].1.total_wh, 1010);
        assert_eq!(filled[0].1.watt, (1010 - 1000) * 3600 / 300);
        // Slot of 00:15 local; the interval to the previous valid record is
        // five minutes even though invalid records arrived in between.
        assert_eq!(filled[1].0, 3);
        assert_eq!(filled[1].1.watt, (1030 - 1010) * 3600 / 300);
    }

    #[test]
    fn day_filter_does_not_advance_on_invalid_records() {
        let tz = Brussels;
        let day = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let day_start = local_day_start(day, tz).unwrap();

        let mut dev = Inverter::default();
        let mut accum = DayAccum::default();

        apply_day_record(&mut dev, day, tz, &mut accum, day_start + 300, 500);
        // Invalid: goes backwards. prev_* must stay at the last valid pair.
        apply_day_record(&mut dev, day, tz, &mut accum, day_start + 600, 400);
        // Valid again; the span is 10 minutes.
        apply_day_record(&mut dev, day, tz, &mut accum, day_start + 900, 800);

        let slot = dev.day_data.iter().find(|s| s.datetime != 0).unwrap();
        assert_eq!(slot.watt, (800 - 500) * 3600 / 600);
    }

    #[test]
    fn day_records_outside_requested_day_are_ignored() {
        let tz = Brussels;
        let day = NaiveDate::from_ymd_opt(2024, 10, 27).unwrap(); // DST fall-back day
        let day_start = local_day_start(day, tz).unwrap();

        let mut dev = Inverter::default();
        let mut accum = DayAccum::default();

        apply_day_record(&mut dev, day, tz, &mut accum, day_start + 300, 100);
        apply_day_record(&mut dev, day, tz, &mut accum, day_start + 600, 110);
        // Well past the (25 hour) civil day.
        apply_day_record(&mut dev, day, tz, &mut accum, day_start + 26 * 3600, 500);

        let filled = dev.day_data.iter().filter(|s| s.datetime != 0).count();
        assert_eq!(filled, 1);
    }

    #[test]
    fn dst_day_slot_mapping_stays_in_range() {
        let tz = Brussels;
        let day = NaiveDate::from_ymd_opt(2024, 10, 27).unwrap();
        let day_start = local_day_start(day, tz).unwrap();

        let mut dev = Inverter::default();
        let mut accum = DayAccum::default();
        // Walk the whole 25-hour day in 5 minute steps; no slot may fall
        // outside the array and no panic may occur.
        let mut wh = 1000u64;
        let mut dt = day_start;
        while dt < day_start + 25 * 3600 {
            apply_day_record(&mut dev, day, tz, &mut accum, dt, wh);
            dt += 300;
            wh += 5;
        }
        assert!(dev.has_day_data);
    }

    #[test]
    fn month_records_only_for_requested_month() {
        let mut dev = Inverter::default();
        let mut accum = MonthAccum::default();

        // 2024-05-31 23:59:00 UTC seeds prev.
        apply_month_record(&mut dev, 6, &mut accum, 1_717_199_940, 5000);
        // June days.
        apply_month_record(&mut dev, 6, &mut accum, 1_717_286_400, 5100);
        apply_month_record(&mut dev, 6, &mut accum, 1_717_372_800, 5250);
        // NaN dropped without advancing.
        apply_month_record(&mut dev, 6, &mut accum, 1_717_459_200, NAN_U64);
        apply_month_record(&mut dev, 6, &mut accum, 1_717_459_200, 5400);

        assert!(dev.has_month_data);
        assert_eq!(dev.month_data[0].total_wh, 5100);
        assert_eq!(dev.month_data[0].day_wh, 100);
        assert_eq!(dev.month_data[1].day_wh, 150);
        assert_eq!(dev.month_data[2].day_wh, 150);
        assert_eq!(dev.month_data[3].datetime, 0);
    }

    #[test]
    fn multigate_day_consolidation_sums_children() {
        let mut roster = vec![Inverter::default(), Inverter::default(), Inverter::default()];
        roster[0].susy_id = crate::protocol::SID_MULTIGATE;
        for (i, child) in roster.iter_mut().enumerate().skip(1) {
            child.susy_id = crate::protocol::SID_SB240;
            child.multigate_id = Some(0);
            child.day_data[10].datetime = 1_718_445_600;
            child.day_data[10].total_wh = 100 * i as i64;
            child.day_data[10].watt = 10 * i as i64;
        }

        consolidate_day(&mut roster);

        assert!(roster[0].has_day_data);
        assert_eq!(roster[0].day_data[10].total_wh, 100 + 200);
        assert_eq!(roster[0].day_data[10].watt, 10 + 20);
        assert_eq!(roster[0].day_data[10].datetime, 1_718_445_600);
        assert_eq!(roster[0].day_data[11].total_wh, 0);
    }

    #[test]
    fn multigate_month_consolidation_sums_children() {
        let mut roster = vec![Inverter::default(), Inverter::default()];
        roster[0].susy_id = crate::protocol::SID_MULTIGATE;
        roster[1].susy_id = crate::protocol::SID_SB240;
        roster[1].multigate_id = Some(0);
        roster[1].month_data[3].datetime = 1_717_286_400;
        roster[1].month_data[3].total_wh = 4200;
        roster[1].month_data[3].day_wh = 180;

        consolidate_month(&mut roster);

        assert_eq!(roster[0].month_data[3].total_wh, 4200);
        assert_eq!(roster[0].month_data[3].day_wh, 180);
    }

    #[test]
    fn civil_day_start_handles_dst_transition() {
        let tz = Brussels;
        // 2024-10-27 02:30 CEST, during the ambiguous hour.
        let ts = 1_729_989_000;
        let start = civil_day_start(ts, tz).unwrap();
        let local = DateTime::<Utc>::from_timestamp(start, 0)
            .unwrap()
            .with_timezone(&tz);
        assert_eq!(local.hour(), 0);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2024, 10, 27).unwrap());
        // The civil day is 25 hours long.
        let next = local_day_start(NaiveDate::from_ymd_opt(2024, 10, 28).unwrap(), tz).unwrap();
        assert_eq!(next - start, 25 * 3600);
    }

    #[test]
    fn days_in_month_counts() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
    }
}
