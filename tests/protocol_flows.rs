//! End-to-end protocol flows against a scripted transport.
//!
//! The mock plays the inverter side: scripted replies are handed out in
//! order on `recv`, each one built against the packet id of the most recent
//! request so the correlation logic is exercised for real.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};

use sunwire::archive::EventSweep;
use sunwire::domain::{Inverter, UserGroup};
use sunwire::engine::Query;
use sunwire::error::{Result, SmaError};
use sunwire::protocol::frame::FrameBuilder;
use sunwire::protocol::reply::{BtFrame, ReplyFrame};
use sunwire::protocol::{BtAddr, LinkKind, ETH_L2_SIGNATURE};
use sunwire::session::Session;
use sunwire::tags::TagCatalog;
use sunwire::transport::{FrameSource, RawFrame, Transport};

type ReplyFn = Box<dyn FnMut(u16) -> RawFrame + Send>;

struct MockTransport {
    kind: LinkKind,
    replies: VecDeque<ReplyFn>,
    last_pid: u16,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockTransport {
    fn new(kind: LinkKind, replies: Vec<ReplyFn>) -> (MockTransport, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            MockTransport {
                kind,
                replies: replies.into(),
                last_pid: 0,
                sent: sent.clone(),
            },
            sent,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    async fn send(&mut self, frame: &[u8], _dst: Option<Ipv4Addr>) -> Result<()> {
        match self.kind {
            LinkKind::Speedwire => {
                if let Ok(req) = ReplyFrame::from_datagram(frame) {
                    if let Ok(pid) = req.packet_id() {
                        self.last_pid = pid;
                    }
                }
            }
            LinkKind::Bluetooth => {
                if let Ok(parsed) = BtFrame::parse(frame) {
                    if let Ok(req) = parsed.into_reply() {
                        if let Ok(pid) = req.packet_id() {
                            self.last_pid = pid;
                        }
                    }
                }
            }
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn recv(&mut self, _timeout: Duration) -> Result<RawFrame> {
        match self.replies.pop_front() {
            Some(mut f) => Ok(f(self.last_pid)),
            None => Err(SmaError::NoData),
        }
    }

    async fn drain(&mut self) {}
}

/// Build a Speedwire SMAdata2 reply from device `(susy_id, serial)`.
#[allow(clippy::too_many_arguments)]
fn l2_reply(
    device: (u16, u32),
    pid: u16,
    error: u16,
    fragments: u16,
    command: u32,
    first: u32,
    last: u32,
    records: &[u8],
) -> RawFrame {
    let mut b = FrameBuilder::new(LinkKind::Speedwire);
    b.begin_eth();
    b.write_u32(ETH_L2_SIGNATURE);
    b.write_u8((9 + records.len() / 4) as u8);
    b.write_u8(0xA0);
    // Destination: the polling application.
    b.write_u16(125);
    b.write_u32(0x3938_0001);
    b.write_u16(0);
    // Source: the inverter.
    b.write_u16(device.0);
    b.write_u32(device.1);
    b.write_u16(0);
    b.write_u16(error);
    b.write_u16(fragments);
    b.write_u16(pid | 0x8000);
    b.write_u32(command);
    b.write_u32(first);
    b.write_u32(last);
    b.write_bytes(records);
    b.write_trailer();
    b.write_length();
    RawFrame {
        data: b.finish().unwrap().to_vec(),
        source: FrameSource::Ip(Ipv4Addr::new(192, 168, 178, 30)),
    }
}

fn identity_reply(device: (u16, u32)) -> ReplyFn {
    Box::new(move |pid| l2_reply(device, pid, 0, 0, 0x0000_0001, 0, 0, &[]))
}

fn logon_reply(device: (u16, u32), error: u16) -> ReplyFn {
    Box::new(move |pid| l2_reply(device, pid, error, 0, 0xFFFD_040C, 0, 0, &[]))
}

fn total_power_record(watts: i32) -> Vec<u8> {
    let mut rec = vec![0u8; 28];
    LittleEndian::write_u32(&mut rec[0..4], 0x4026_3F00);
    LittleEndian::write_u32(&mut rec[4..8], 1_718_445_600);
    LittleEndian::write_i32(&mut rec[16..20], watts);
    rec
}

fn total_power_reply(device: (u16, u32), watts: i32, pid_shift: u16) -> ReplyFn {
    Box::new(move |pid| {
        l2_reply(
            device,
            pid.wrapping_add(pid_shift),
            0,
            0,
            0x5100_0200,
            1,
            1,
            &total_power_record(watts),
        )
    })
}

fn event_record(datetime: i32, entry_id: u16) -> Vec<u8> {
    let mut rec = vec![0u8; 48];
    LittleEndian::write_i32(&mut rec[0..4], datetime);
    LittleEndian::write_u16(&mut rec[4..6], entry_id);
    LittleEndian::write_u16(&mut rec[6..8], 0x009D);
    LittleEndian::write_u32(&mut rec[8..12], 2_100_132_710);
    LittleEndian::write_u16(&mut rec[12..14], 10251);
    LittleEndian::write_u16(&mut rec[14..16], 2);
    LittleEndian::write_u32(&mut rec[24..28], 10251);
    rec
}

fn day_record(datetime: i64, total_wh: u64) -> Vec<u8> {
    let mut rec = vec![0u8; 12];
    LittleEndian::write_u32(&mut rec[0..4], datetime as u32);
    LittleEndian::write_u64(&mut rec[4..12], total_wh);
    rec
}

fn speedwire_session(replies: Vec<ReplyFn>) -> (Session, Arc<Mutex<Vec<Vec<u8>>>>) {
    let (mock, sent) = MockTransport::new(LinkKind::Speedwire, replies);
    (
        Session::new(Box::new(mock), TagCatalog::default(), Duration::from_millis(20)),
        sent,
    )
}

fn roster_device(susy_id: u16, serial: u32) -> Inverter {
    let mut inv = Inverter::default();
    inv.susy_id = susy_id;
    inv.serial = serial;
    inv.ip_address = Some(Ipv4Addr::new(192, 168, 178, 30));
    inv
}

/// Speedwire plant with two configured IPs: discovery yields two distinct
/// identities, both log on, and a total-power query decodes one record per
/// device.
#[tokio::test]
async fn speedwire_two_inverter_cycle() {
    let dev_a = (0x0149, 2_100_132_710);
    let dev_b = (0x0149, 2_100_132_711);

    let (mut session, _sent) = speedwire_session(vec![
        identity_reply(dev_a),
        identity_reply(dev_b),
        logon_reply(dev_a, 0),
        logon_reply(dev_b, 0),
        total_power_reply(dev_a, 4213, 0),
        total_power_reply(dev_b, 3791, 0),
    ]);

    let ips = vec![
        Ipv4Addr::new(192, 168, 178, 30),
        Ipv4Addr::new(192, 168, 178, 31),
    ];
    session.initialise(None, &ips, true).await.unwrap();

    assert_eq!(session.roster.len(), 2);
    assert_eq!(session.roster[0].serial, dev_a.1);
    assert_eq!(session.roster[1].serial, dev_b.1);
    assert_ne!(
        (session.roster[0].susy_id, session.roster[0].serial),
        (session.roster[1].susy_id, session.roster[1].serial)
    );

    session.logon(UserGroup::User, "0000").await.unwrap();

    session.fetch_data(Query::SpotAcTotalPower).await.unwrap();
    assert_eq!(session.roster[0].total_pac, 4213);
    assert_eq!(session.roster[1].total_pac, 3791);
}

/// An invalid password surfaces as `InvalidPassword` from the logon
/// handshake.
#[tokio::test]
async fn speedwire_logon_rejects_bad_password() {
    let dev = (0x0149, 2_100_132_710);
    let (mut session, _sent) = speedwire_session(vec![logon_reply(dev, 0x0100)]);
    session.roster.push(roster_device(dev.0, dev.1));

    let err = session.logon(UserGroup::User, "9999").await.unwrap_err();
    assert!(matches!(err, SmaError::InvalidPassword));
}

/// A reply with a foreign packet id is discarded; the matching one is
/// accepted exactly once.
#[tokio::test]
async fn packet_id_mismatch_is_discarded() {
    let dev = (0x0149, 2_100_132_710);
    let (mut session, _sent) = speedwire_session(vec![
        total_power_reply(dev, 9999, 1), // wrong packet id
        total_power_reply(dev, 4213, 0),
    ]);
    session.roster.push(roster_device(dev.0, dev.1));

    session.fetch_device_data(0, Query::SpotAcTotalPower).await.unwrap();
    assert_eq!(session.roster[0].total_pac, 4213);
}

/// Nothing but mismatched replies ends in a receive timeout, not in stale
/// data.
#[tokio::test]
async fn packet_id_mismatch_alone_times_out() {
    let dev = (0x0149, 2_100_132_710);
    let (mut session, _sent) =
        speedwire_session(vec![total_power_reply(dev, 9999, 1)]);
    session.roster.push(roster_device(dev.0, dev.1));

    let err = session
        .fetch_device_data(0, Query::SpotAcTotalPower)
        .await
        .unwrap_err();
    assert!(matches!(err, SmaError::NoData));
    assert_eq!(session.roster[0].total_pac, 0);
}

/// Fragmented replies are read until the countdown hits zero.
#[tokio::test]
async fn fragmented_reply_is_reassembled() {
    let dev = (0x0149, 2_100_132_710);
    let frag1: ReplyFn = Box::new(move |pid| {
        l2_reply(dev, pid, 0, 1, 0x5100_0200, 1, 1, &total_power_record(1200))
    });
    let frag0: ReplyFn = Box::new(move |pid| {
        l2_reply(dev, pid, 0, 0, 0x5100_0200, 1, 1, &total_power_record(2400))
    });
    let (mut session, _sent) = speedwire_session(vec![frag1, frag0]);
    session.roster.push(roster_device(dev.0, dev.1));

    session.fetch_device_data(0, Query::SpotAcTotalPower).await.unwrap();
    // The later fragment carries the newest value.
    assert_eq!(session.roster[0].total_pac, 2400);
}

/// A device error status aborts the query for that device.
#[tokio::test]
async fn device_status_error_aborts_query() {
    let dev = (0x0149, 2_100_132_710);
    let lri_missing: ReplyFn =
        Box::new(move |pid| l2_reply(dev, pid, 21, 0, 0x5200_0200, 0, 0, &[]));
    let (mut session, _sent) = speedwire_session(vec![lri_missing]);
    session.roster.push(roster_device(dev.0, dev.1));

    let err = session
        .fetch_device_data(0, Query::InverterTemperature)
        .await
        .unwrap_err();
    assert!(matches!(err, SmaError::LriNotAvailable));
}

/// An event stream whose record carries entry id 1 stops the month scan: the
/// sweep reports end-of-log and no further event requests go on the wire.
#[tokio::test]
async fn event_end_of_log_stops_month_scan() {
    let dev = (0x0149, 2_100_132_710);
    let events: ReplyFn = Box::new(move |pid| {
        let mut records = event_record(1_717_200_000, 2);
        records.extend_from_slice(&event_record(1_717_100_000, 1));
        l2_reply(dev, pid, 0, 0, 0x7010_0200, 1, 2, &records)
    });
    let (mut session, sent) = speedwire_session(vec![events]);
    session.roster.push(roster_device(dev.0, dev.1));

    let mut months_scanned = 0;
    let mut month = 6u32;
    for _ in 0..3 {
        months_scanned += 1;
        let sweep = session
            .archive_event_data(2024, month, UserGroup::User)
            .await
            .unwrap();
        if sweep == EventSweep::EndOfLog {
            break;
        }
        month -= 1;
    }

    assert_eq!(months_scanned, 1);
    assert_eq!(session.roster[0].events.len(), 2);
    assert!(session.roster[0].events[1].is_end_of_log());

    // Exactly one event request was emitted.
    let event_requests = sent
        .lock()
        .unwrap()
        .iter()
        .filter(|frame| {
            // Command word of a Speedwire request sits at datagram offset 42.
            frame.len() > 46 && LittleEndian::read_u32(&frame[42..46]) == 0x7010_0200
        })
        .count();
    assert_eq!(event_requests, 1);
}

/// Day archive: valid samples land in their local-time slots with the
/// trailing average power.
#[tokio::test]
async fn day_archive_fills_slots() {
    use chrono_tz::Europe::Brussels;

    let dev = (0x0149, 2_100_132_710);
    // 2024-06-15 00:00 Brussels == 2024-06-14 22:00 UTC.
    let day_start = 1_718_402_400i64;

    let day: ReplyFn = Box::new(move |pid| {
        let mut records = Vec::new();
        records.extend_from_slice(&day_record(day_start + 300, 1_000_000));
        records.extend_from_slice(&day_record(day_start + 600, 1_000_250));
        records.extend_from_slice(&day_record(day_start + 900, 1_000_475));
        l2_reply(dev, pid, 0, 0, 0x7000_0200, 1, 3, &records)
    });
    let (mut session, _sent) = speedwire_session(vec![day]);
    session.roster.push(roster_device(dev.0, dev.1));

    session
        .archive_day_data(day_start + 3600, Brussels)
        .await
        .unwrap();

    let dev0 = &session.roster[0];
    assert!(dev0.has_day_data);
    assert_eq!(dev0.day_data[2].total_wh, 1_000_250);
    assert_eq!(dev0.day_data[2].watt, 250 * 3600 / 300);
    assert_eq!(dev0.day_data[3].total_wh, 1_000_475);
    assert_eq!(dev0.day_data[3].watt, 225 * 3600 / 300);
    assert_eq!(dev0.day_data[1].datetime, 0);
}

/// Multigate roll-up: the parent's slots carry the sum of all children.
#[tokio::test]
async fn multigate_consolidation_after_day_archive() {
    use chrono_tz::Europe::Brussels;
    use sunwire::protocol::{SID_MULTIGATE, SID_SB240};

    let day_start = 1_718_402_400i64;
    let children: Vec<(u16, u32)> = (0..3).map(|i| (SID_SB240, 3_000_000_000 + i)).collect();

    let mut replies: Vec<ReplyFn> = Vec::new();
    for (i, dev) in children.iter().copied().enumerate() {
        let base = 1_000_000 * (i as u64 + 1);
        replies.push(Box::new(move |pid| {
            let mut records = Vec::new();
            records.extend_from_slice(&day_record(day_start + 300, base));
            records.extend_from_slice(&day_record(day_start + 600, base + 100));
            l2_reply(dev, pid, 0, 0, 0x7000_0200, 1, 2, &records)
        }));
    }

    let (mut session, _sent) = speedwire_session(replies);
    let mut multigate = roster_device(SID_MULTIGATE, 1_900_000_000);
    multigate.multigate_id = Some(0);
    session.roster.push(multigate);
    for (susy_id, serial) in children.iter().copied() {
        let mut child = roster_device(susy_id, serial);
        child.multigate_id = Some(0);
        session.roster.push(child);
    }

    session
        .archive_day_data(day_start + 3600, Brussels)
        .await
        .unwrap();

    let parent = &session.roster[0];
    assert!(parent.has_day_data);
    let child_sum: i64 = session.roster[1..]
        .iter()
        .map(|c| c.day_data[2].total_wh)
        .sum();
    assert_eq!(parent.day_data[2].total_wh, child_sum);
    let watt_sum: i64 = session.roster[1..].iter().map(|c| c.day_data[2].watt).sum();
    assert_eq!(parent.day_data[2].watt, watt_sum);
}

/// Firmware probe answering protocol version 3 aborts initialization with
/// `FwVersion` before any further traffic.
#[tokio::test]
async fn bluetooth_old_firmware_is_rejected() {
    let root: BtAddr = "00:80:25:1D:AC:12".parse().unwrap();
    let local: BtAddr = "00:11:22:33:44:55".parse().unwrap();

    let version_reply: ReplyFn = Box::new(move |_pid| {
        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0002, root, local);
        // Payload bytes land at L1 offset 18; offset 19 is the protocol
        // version, offset 22 the net id.
        b.write_bytes(&[0x00, 0x03, 0x00, 0x00, 0x02]);
        b.write_length();
        RawFrame {
            data: b.finish().unwrap().to_vec(),
            source: FrameSource::Bluetooth(root),
        }
    });

    let (mock, sent) = MockTransport::new(LinkKind::Bluetooth, vec![version_reply]);
    let mut session = Session::new(
        Box::new(mock),
        TagCatalog::default(),
        Duration::from_millis(20),
    );

    let err = session.initialise(Some(root), &[], true).await.unwrap_err();
    assert!(matches!(err, SmaError::FwVersion(3)));
    // Only the version probe went out.
    assert_eq!(sent.lock().unwrap().len(), 1);
}
