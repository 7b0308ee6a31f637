//! Framing round-trip properties for both wire formats.

use proptest::prelude::*;

use sunwire::protocol::fcs;
use sunwire::protocol::frame::FrameBuilder;
use sunwire::protocol::reply::{BtFrame, ReplyFrame};
use sunwire::protocol::{BtAddr, LinkKind};

/// Build one L2 frame, rotating the packet id until the FCS avoids the
/// reserved wire bytes, exactly like a live session does.
fn build_bt(payload: &[u8], local: BtAddr, dest: BtAddr) -> (Vec<u8>, u16) {
    let mut packet_id = 0u16;
    loop {
        packet_id = packet_id.wrapping_add(1) & 0x7FFF;
        let mut b = FrameBuilder::new(LinkKind::Bluetooth);
        b.begin_bt(0x0001, local, dest);
        b.open_l2(0x09, 0xA0, 0, 0xFFFF, 0xFFFF_FFFF, 125, 0x3938_0001, packet_id);
        b.write_bytes(payload);
        b.write_trailer();
        b.write_length();
        if b.crc_is_wire_safe() {
            return (b.finish().unwrap().to_vec(), packet_id);
        }
        assert!(packet_id < 0x7FFF, "no wire-safe packet id found");
    }
}

proptest! {
    /// parse(build(P)) == P over the byte-stuffed Bluetooth framing, with a
    /// passing FCS, for arbitrary payloads.
    #[test]
    fn bt_frame_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let local: BtAddr = "00:11:22:33:44:55".parse().unwrap();
        let dest: BtAddr = "00:80:25:1D:AC:12".parse().unwrap();

        let (frame, packet_id) = build_bt(&payload, local, dest);
        // FCS bytes on the wire never collide with the framing bytes.
        prop_assert!(fcs::is_wire_safe(frame[frame.len() - 3], frame[frame.len() - 2]));

        let parsed = BtFrame::parse(&frame).unwrap();
        prop_assert_eq!(parsed.command, 0x0001);
        prop_assert_eq!(parsed.source, local);
        prop_assert_eq!(parsed.dest, dest);

        let reply = parsed.into_reply().unwrap();
        prop_assert!(reply.fcs_is_valid());
        prop_assert_eq!(reply.packet_id().unwrap(), packet_id);
        // The L2 payload region survives stuffing and unstuffing intact.
        let end = reply.payload_end();
        prop_assert_eq!(&reply.data()[29..end], payload.as_slice());
    }

    /// parse(build(P)).body == P for Speedwire, and the L1 length field
    /// counts exactly the bytes after the fixed L1+L2 header.
    #[test]
    fn speedwire_frame_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut b = FrameBuilder::new(LinkKind::Speedwire);
        b.begin_eth();
        b.open_l2(0x09, 0xA0, 0, 0xFFFF, 0xFFFF_FFFF, 125, 0x3938_0001, 0x0042);
        b.write_bytes(&payload);
        b.write_trailer();
        b.write_length();
        let frame = b.finish().unwrap().to_vec();

        let declared = usize::from(frame[12]) << 8 | usize::from(frame[13]);
        prop_assert_eq!(declared, frame.len() - 20);

        let reply = ReplyFrame::from_datagram(&frame).unwrap();
        prop_assert_eq!(reply.packet_id().unwrap(), 0x0042);
        // Body before the zero footer.
        let end = reply.len() - 4;
        prop_assert_eq!(&reply.data()[29..end], payload.as_slice());
    }

    /// The table-driven FCS matches its defining recurrence and detects
    /// single-bit corruption.
    #[test]
    fn fcs_detects_corruption(payload in proptest::collection::vec(any::<u8>(), 1..256),
                              flip in 0usize..256, bit in 0u8..8) {
        let checksum = fcs::compute(&payload);
        let mut framed = payload.clone();
        framed.push((checksum & 0xFF) as u8);
        framed.push((checksum >> 8) as u8);
        prop_assert!(fcs::check(&framed));

        let idx = flip % payload.len();
        framed[idx] ^= 1 << bit;
        prop_assert!(!fcs::check(&framed));
    }
}
