//! Inverter event log records.

use byteorder::{ByteOrder, LittleEndian};

use super::UserGroup;
use crate::error::{Result, SmaError};
use crate::protocol::nan::NAN_U32;
use crate::tags::TagCatalog;

/// Wire size of one event record.
pub const EVENT_RECORD_LEN: usize = 48;

/// Tag id base of the event group field.
const GROUP_TAG_OFFSET: u32 = 829;

/// One entry of the inverter event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub datetime: i64,
    pub entry_id: u16,
    pub susy_id: u16,
    pub serial: u32,
    pub event_code: u16,
    pub event_flags: u16,
    pub group: u32,
    pub tag: u32,
    pub counter: u32,
    pub user_group: UserGroup,
    pub args: [u8; 16],
}

impl EventRecord {
    /// Parse one 48-byte wire record. Returns `None` for padding entries
    /// (datetime zero).
    pub fn parse(rec: &[u8], user_group: UserGroup) -> Result<Option<EventRecord>> {
        if rec.len() < EVENT_RECORD_LEN {
            return Err(SmaError::ShortFrame {
                needed: EVENT_RECORD_LEN,
                len: rec.len(),
            });
        }
        let datetime = i64::from(LittleEndian::read_i32(&rec[0..4]));
        if datetime == 0 {
            return Ok(None);
        }
        let mut args = [0u8; 16];
        args.copy_from_slice(&rec[32..48]);
        Ok(Some(EventRecord {
            datetime,
            entry_id: LittleEndian::read_u16(&rec[4..6]),
            susy_id: LittleEndian::read_u16(&rec[6..8]),
            serial: LittleEndian::read_u32(&rec[8..12]),
            event_code: LittleEndian::read_u16(&rec[12..14]),
            event_flags: LittleEndian::read_u16(&rec[14..16]),
            group: LittleEndian::read_u32(&rec[16..20]),
            // rec[20..24] is reserved.
            tag: LittleEndian::read_u32(&rec[24..28]),
            counter: LittleEndian::read_u32(&rec[28..32]),
            user_group,
            args,
        }))
    }

    /// Marks the oldest entry of the log.
    pub fn is_end_of_log(&self) -> bool {
        self.entry_id == 1
    }

    pub fn event_type(&self) -> &'static str {
        match self.event_flags & 7 {
            0 => "Incoming",
            1 => "Outgoing",
            2 => "Event",
            3 => "Acknowledge",
            4 => "Reminder",
            _ => "Invalid",
        }
    }

    pub fn event_category(&self) -> &'static str {
        match (self.event_flags >> 14) & 3 {
            0 => "Info",
            1 => "Warning",
            2 => "Error",
            _ => "None",
        }
    }

    pub fn group_tag_id(&self) -> u32 {
        (self.group & 0x1F) + GROUP_TAG_OFFSET
    }

    pub fn user_group_tag_id(&self) -> u32 {
        self.user_group.tag_id()
    }

    // Argument words, little endian.
    pub fn dt_change(&self) -> u32 {
        LittleEndian::read_u32(&self.args[0..4])
    }

    pub fn parameter(&self) -> u32 {
        LittleEndian::read_u32(&self.args[4..8])
    }

    pub fn new_value(&self) -> u32 {
        LittleEndian::read_u32(&self.args[8..12])
    }

    pub fn old_value(&self) -> u32 {
        LittleEndian::read_u32(&self.args[12..16])
    }

    pub fn data_type(&self) -> u32 {
        self.parameter() >> 24
    }

    /// String argument, nul-terminated inside the 16-byte area.
    pub fn s0(&self) -> String {
        let end = self.args.iter().position(|b| *b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.args[..end]).into_owned()
    }

    fn x(&self, idx: usize) -> String {
        if idx < self.args.len() {
            format!("{:02X}", self.args[idx])
        } else {
            String::new()
        }
    }

    /// Resolve the localized description, substituting template tokens
    /// against this record's fields.
    pub fn description(&self, tags: &TagCatalog) -> String {
        let mut descr = tags.description(self.tag).unwrap_or_default().to_string();
        if !descr.contains('|') {
            return descr;
        }

        if descr.contains("|ln04|") {
            let lri_desc = tags.description_for_lri(self.parameter()).unwrap_or_default();
            descr = descr.replace("|ln04|", &format!("\"{lri_desc}\""));
        }
        if descr.contains("|tn0|") {
            descr = descr.replace("|tn0|", tags.description(self.dt_change()).unwrap_or_default());
        }
        if descr.contains("|tn4|") {
            descr = descr.replace("|tn4|", tags.description(self.parameter()).unwrap_or_default());
        }
        if descr.contains("|tn8|") {
            let v = tags.description(self.new_value()).unwrap_or_default();
            descr = descr.replace("|tn8|", &format!("\"{v}\""));
        }
        if descr.contains("|tnc|") {
            let v = tags.description(self.old_value()).unwrap_or_default();
            descr = descr.replace("|tnc|", &format!("\"{v}\""));
        }
        if descr.contains("|s0|") {
            descr = descr.replace("|s0|", &self.s0());
        }
        if descr.contains("|x") {
            for i in 0..self.args.len() {
                let lower = format!("|x{i:x}|");
                if descr.contains(&lower) {
                    descr = descr.replace(&lower, &self.x(i));
                }
                if i > 9 {
                    let upper = format!("|x{i:X}|");
                    if descr.contains(&upper) {
                        descr = descr.replace(&upper, &self.x(i));
                    }
                }
            }
        }

        descr
    }

    /// String parameter of parameter-change events, when present.
    pub fn str_parameter(&self) -> Option<String> {
        const EVT_SET_STR_PARA_OK: u16 = 10104;
        const EVT_SET_STR_PARA_NOK: u16 = 10105;
        if self.event_code == EVT_SET_STR_PARA_OK || self.event_code == EVT_SET_STR_PARA_NOK {
            if self.new_value() != NAN_U32 {
                return Some(self.s0());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_record(datetime: i32, entry_id: u16, flags: u16) -> [u8; EVENT_RECORD_LEN] {
        let mut rec = [0u8; EVENT_RECORD_LEN];
        LittleEndian::write_i32(&mut rec[0..4], datetime);
        LittleEndian::write_u16(&mut rec[4..6], entry_id);
        LittleEndian::write_u16(&mut rec[6..8], 0x009D);
        LittleEndian::write_u32(&mut rec[8..12], 2_000_562_999);
        LittleEndian::write_u16(&mut rec[12..14], 10251);
        LittleEndian::write_u16(&mut rec[14..16], flags);
        LittleEndian::write_u32(&mut rec[16..20], 0x0000_0002);
        LittleEndian::write_u32(&mut rec[24..28], 10251);
        LittleEndian::write_u32(&mut rec[28..32], 7);
        rec
    }

    #[test]
    fn parse_and_classify() {
        let rec = wire_record(1_700_000_000, 42, 2 | (1 << 14));
        let ev = EventRecord::parse(&rec, UserGroup::User).unwrap().unwrap();
        assert_eq!(ev.datetime, 1_700_000_000);
        assert_eq!(ev.entry_id, 42);
        assert_eq!(ev.susy_id, 0x009D);
        assert_eq!(ev.event_code, 10251);
        assert_eq!(ev.event_type(), "Event");
        assert_eq!(ev.event_category(), "Warning");
        assert_eq!(ev.group_tag_id(), 831);
        assert!(!ev.is_end_of_log());
    }

    #[test]
    fn zero_datetime_is_padding() {
        let rec = wire_record(0, 1, 0);
        assert!(EventRecord::parse(&rec, UserGroup::User).unwrap().is_none());
    }

    #[test]
    fn entry_one_marks_end_of_log() {
        let rec = wire_record(1_700_000_000, 1, 0);
        let ev = EventRecord::parse(&rec, UserGroup::Installer).unwrap().unwrap();
        assert!(ev.is_end_of_log());
        assert_eq!(ev.user_group_tag_id(), 862);
    }

    #[test]
    fn short_record_is_rejected() {
        let rec = [0u8; 20];
        assert!(matches!(
            EventRecord::parse(&rec, UserGroup::User),
            Err(SmaError::ShortFrame { .. })
        ));
    }
}
