//! Advertisement builders
//!
//! Produces well-formed payloads for every packet kind, wrapped in a
//! [`DecodedFrame`] from a fixed source.

use beacon_protocol::DecodedFrame;
use beacon_upstream::now_millis;
use uuid::Uuid;

/// Length of every payload built here
pub const FRAME_LEN: usize = 29;

const FILL: u8 = 0x11;

/// Packet id carried in the last four bytes
pub type PacketId = [u8; 4];

/// Builds frames as seen from one peripheral
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    source_id: Uuid,
    rssi: i32,
    captured_at_ms: Option<f64>,
}

impl FrameBuilder {
    pub fn new(source_id: Uuid) -> Self {
        Self {
            source_id,
            rssi: -60,
            captured_at_ms: None,
        }
    }

    /// Builder for a fresh random source
    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    pub fn rssi(mut self, rssi: i32) -> Self {
        self.rssi = rssi;
        self
    }

    /// Fix the capture time instead of stamping the wall clock
    pub fn at(mut self, captured_at_ms: f64) -> Self {
        self.captured_at_ms = Some(captured_at_ms);
        self
    }

    /// Tag advertisement
    pub fn pixel(&self, packet_id: PacketId) -> DecodedFrame {
        let mut payload = vec![0x05, 0x00, 0x00, 0x00, 0x00];
        finish(&mut payload, packet_id);
        self.frame(payload)
    }

    /// Tag side info with the bridge that relayed `packet_id`
    pub fn side_info(&self, packet_id: PacketId, bridge: [u8; 6], nfpkt: u16, rssi: u8) -> DecodedFrame {
        let mut payload = vec![0xFC, 0xC6, 0x00, 0x00, 0xEC];
        payload.extend_from_slice(&bridge);
        payload.extend_from_slice(&nfpkt.to_be_bytes());
        payload.push(rssi);
        finish(&mut payload, packet_id);
        self.frame(payload)
    }

    /// Third-party sensor side info
    pub fn sensor_side_info(&self, packet_id: PacketId, sensor: SensorInfo) -> DecodedFrame {
        let mut payload = vec![0xFC, 0xC6, 0x00, 0x00, 0xEB];
        payload.extend_from_slice(&sensor.bridge);
        payload.extend_from_slice(&sensor.counter.to_le_bytes());
        payload.push(sensor.rssi);
        payload.push(0x00);
        payload.extend_from_slice(&sensor.sensor_mac);
        payload.extend_from_slice(&sensor.service_id);
        payload.push(sensor.flags);
        payload.extend_from_slice(&packet_id);
        self.frame(payload)
    }

    /// Third-party sensor data frame
    pub fn sensor_data(&self, packet_id: PacketId) -> DecodedFrame {
        let mut payload = vec![0xFC, 0x90];
        finish(&mut payload, packet_id);
        self.frame(payload)
    }

    /// Bridge heartbeat announcing `bridge`
    pub fn heartbeat(&self, bridge: [u8; 6]) -> DecodedFrame {
        let mut payload = vec![0xFC, 0xC6, 0x00, 0x00, 0xEE, 0x02, 0x01, 0x00];
        payload.extend_from_slice(&bridge);
        payload.resize(FRAME_LEN, FILL);
        self.frame(payload)
    }

    /// Self-contained bridge frame
    pub fn combined(&self, packet_id: PacketId) -> DecodedFrame {
        let mut payload = vec![0xFC, 0xC6, 0x00, 0x00, 0x3F];
        finish(&mut payload, packet_id);
        self.frame(payload)
    }

    /// Gateway-to-bridge command echoed over the air
    pub fn bridge_command(&self) -> DecodedFrame {
        let mut payload = vec![0xFC, 0xC6, 0x00, 0x00, 0xED, 0x01];
        payload.resize(FRAME_LEN, FILL);
        self.frame(payload)
    }

    fn frame(&self, payload: Vec<u8>) -> DecodedFrame {
        let captured_at_ms = self.captured_at_ms.unwrap_or_else(now_millis);
        DecodedFrame::new(self.source_id, self.rssi, payload, captured_at_ms)
    }
}

/// Fields of a third-party sensor side-info frame
#[derive(Debug, Clone, Copy)]
pub struct SensorInfo {
    pub bridge: [u8; 6],
    pub counter: u16,
    pub rssi: u8,
    pub sensor_mac: [u8; 6],
    pub service_id: [u8; 3],
    pub flags: u8,
}

fn finish(payload: &mut Vec<u8>, packet_id: PacketId) {
    payload.resize(FRAME_LEN - packet_id.len(), FILL);
    payload.extend_from_slice(&packet_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::{number_of_packets, PacketKind, SensorSideInfo};
    use proptest::prelude::*;

    const ID: PacketId = [0xDE, 0xAD, 0xBE, 0xEF];

    #[test]
    fn test_every_builder_classifies() {
        let b = FrameBuilder::random().at(1.0);
        let sensor = SensorInfo {
            bridge: [1, 2, 3, 4, 5, 6],
            counter: 7,
            rssi: 180,
            sensor_mac: [9; 6],
            service_id: [0x00, 0x05, 0x0A],
            flags: 0x05,
        };
        let cases = [
            (b.pixel(ID), PacketKind::Pixel),
            (b.side_info(ID, [1; 6], 3, 200), PacketKind::SideInfo),
            (b.sensor_side_info(ID, sensor), PacketKind::SideInfoThirdParty),
            (b.sensor_data(ID), PacketKind::ThirdPartySensor),
            (b.heartbeat([1; 6]), PacketKind::BridgeToGateway),
            (b.combined(ID), PacketKind::Combined),
            (b.bridge_command(), PacketKind::GatewayToBridge),
        ];
        for (frame, kind) in cases {
            assert_eq!(frame.payload.len(), FRAME_LEN);
            assert_eq!(frame.kind(), kind, "{}", frame.payload_hex());
        }
    }

    #[test]
    fn test_sensor_side_info_parses_back() {
        let sensor = SensorInfo {
            bridge: [1, 2, 3, 4, 5, 6],
            counter: 0x0102,
            rssi: 180,
            sensor_mac: [0xAA; 6],
            service_id: [0x00, 0x05, 0x0A],
            flags: 0x05,
        };
        let frame = FrameBuilder::random().sensor_side_info(ID, sensor);
        let info = SensorSideInfo::parse(&frame.payload).unwrap();
        assert_eq!(info.bridge_mac, "010203040506");
        assert_eq!(info.packet_counter, 0x0102);
        assert_eq!(info.sensor_mac, "AAAAAAAAAAAA");
        assert_eq!(info.sensor_service_id, "00050A");
        assert!(info.flags.is_sensor && info.flags.is_scrambled && !info.flags.is_embedded);
        assert_eq!(frame.suffix_hex().as_deref(), Some("DEADBEEF"));
    }

    proptest! {
        #[test]
        fn side_info_and_pixel_share_correlation_suffix(
            id in prop::array::uniform4(any::<u8>()),
            nfpkt in any::<u16>(),
        ) {
            let b = FrameBuilder::random().at(1.0);
            let tag = b.pixel(id);
            let side = b.side_info(id, [7; 6], nfpkt, 100);
            prop_assert_eq!(tag.kind(), PacketKind::Pixel);
            prop_assert_eq!(side.kind(), PacketKind::SideInfo);
            prop_assert_eq!(tag.suffix_hex(), side.suffix_hex());
            prop_assert_eq!(
                number_of_packets(&side.payload),
                Some(u32::from(nfpkt))
            );
        }
    }
}
