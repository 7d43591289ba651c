use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Well-known ports of the device family.
pub const SCAN_SERVER_CTRL_PORT: u16 = 12346;
pub const BROADCAST_DISCOVER_PORT: u16 = 12347;
pub const SCAN_SERVER_DATA_PORT: u16 = 12348;
pub const SCAN_SERVER_UPDATE_PORT: u16 = 21232;

/// Largest control response the client reads (image responses dominate).
pub const MAX_CTRL_RESPONSE_SIZE: usize = 0x20_0000;

bitflags::bitflags! {
    /// Data regions present in a profile datagram, in payload order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataTypeMask: u16 {
        const BRIGHTNESS = 1 << 0;
        const XY         = 1 << 1;
        const SUBPIXEL   = 1 << 2;
    }
}

/// Camera orientation sent with per-pair scan configuration, derived from
/// the cable orientation and which camera port is the upstream one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraOrientation {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectData {
    pub serial_number: u32,
    pub id: u32,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraLaserConfiguration {
    pub camera_port: u32,
    pub laser_port: u32,
    pub laser_on_time_min_ns: u32,
    pub laser_on_time_def_ns: u32,
    pub laser_on_time_max_ns: u32,
    pub scan_end_offset_ns: u32,
    pub camera_orientation: CameraOrientation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfigurationData {
    pub data_type_mask: u16,
    pub data_stride: u32,
    pub scan_period_ns: u32,
    pub laser_detection_threshold: u32,
    pub saturation_threshold: u32,
    pub saturation_percent: u32,
    pub camera_laser_configurations: Vec<CameraLaserConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreAlignmentData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub x_offset: f64,
    pub y_offset: f64,
    pub roll: f64,
    pub fit_error: f64,
    pub timestamp_s: i64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanStartData {
    pub start_time_ns: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConstraintData {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfigurationData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub constraints: Vec<ConstraintData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionMaskData {
    pub camera_port: u32,
    pub laser_port: u32,
    /// MSB-first bit per pixel over the camera's full dimensions.
    pub mask: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrightnessCorrectionData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub image_offset: f64,
    pub scale_factors: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EncoderAssignmentData {
    pub serial_main: u32,
    pub serial_aux1: u32,
    pub serial_aux2: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImageRequestData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub camera_exposure_ns: u32,
    pub laser_on_time_ns: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfileRequestData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub camera_exposure_ns: u32,
    pub laser_on_time_ns: u32,
    pub laser_detection_threshold: u32,
    pub saturation_threshold: u32,
    pub camera_orientation: CameraOrientation,
}

/// Every message the client can issue over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Connect(ConnectData),
    Disconnect,
    StatusRequest,
    KeepAlive,
    HeartBeat,
    ScanConfiguration(ScanConfigurationData),
    StoreAlignment(StoreAlignmentData),
    ScanStart(Option<ScanStartData>),
    ScanStop,
    WindowConfiguration(WindowConfigurationData),
    ExclusionMask(ExclusionMaskData),
    BrightnessCorrection(BrightnessCorrectionData),
    EncoderAssignment(EncoderAssignmentData),
    ImageRequest(ImageRequestData),
    ProfileRequest(ProfileRequestData),
    ScanSyncStatusRequest,
    RebootRequest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraStatusData {
    pub port: u32,
    pub temperature: i32,
    pub pixels_in_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub global_time_ns: u64,
    pub num_profiles_sent: u32,
    pub camera_data: Vec<CameraStatusData>,
    pub encoders: Vec<i64>,
    pub min_scan_period_ns: u32,
    pub state: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub encoders: Vec<i64>,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfilePointData {
    pub x: i16,
    pub y: i16,
    pub brightness: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileData {
    pub camera_port: u32,
    pub laser_port: u32,
    pub timestamp_ns: u64,
    pub laser_on_time_ns: u32,
    pub valid_points: u32,
    pub encoders: Vec<i64>,
    pub points: Vec<ProfilePointData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSyncStatusData {
    /// Serial numbers of the ScanSyncs this head currently hears.
    pub serials: Vec<u32>,
}

/// Every message a scan head can answer with on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Status(StatusData),
    Image(ImageData),
    Profile(ProfileData),
    ScanSyncStatus(ScanSyncStatusData),
}

/// Discovery probe broadcast by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClientDiscovery {
    pub api_version_major: u32,
    pub api_version_minor: u32,
    pub api_version_patch: u32,
}

/// Discovery response sent by a scan head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDiscovery {
    pub serial_number: u32,
    pub type_code: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    pub ip_server: u32,
    pub link_speed_mbps: u32,
    pub state: u32,
    pub type_str: String,
}

/// Encode a message through the schema serializer.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| Error::Internal(format!("message encode: {}", e)))
}

/// Decode a message; a malformed buffer is an internal error since framing
/// already guaranteed message boundaries.
pub fn decode<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> Result<T> {
    bincode::deserialize(buf).map_err(|e| Error::Internal(format!("message decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trip() {
        let msg = ClientMessage::ScanConfiguration(ScanConfigurationData {
            data_type_mask: (DataTypeMask::XY | DataTypeMask::BRIGHTNESS).bits(),
            data_stride: 1,
            scan_period_ns: 5_000_000,
            laser_detection_threshold: 120,
            saturation_threshold: 800,
            saturation_percent: 30,
            camera_laser_configurations: vec![CameraLaserConfiguration {
                camera_port: 0,
                laser_port: 0,
                laser_on_time_min_ns: 100_000,
                laser_on_time_def_ns: 500_000,
                laser_on_time_max_ns: 1_000_000,
                scan_end_offset_ns: 1_010_000,
                camera_orientation: CameraOrientation::Upstream,
            }],
        });

        let bytes = encode(&msg).unwrap();
        let back: ClientMessage = decode(&bytes).unwrap();
        match back {
            ClientMessage::ScanConfiguration(cfg) => {
                assert_eq!(cfg.scan_period_ns, 5_000_000);
                assert_eq!(cfg.camera_laser_configurations.len(), 1);
                assert_eq!(
                    cfg.camera_laser_configurations[0].scan_end_offset_ns,
                    1_010_000
                );
            }
            other => panic!("wrong message decoded: {:?}", other),
        }
    }

    #[test]
    fn status_round_trip() {
        let msg = ServerMessage::Status(StatusData {
            global_time_ns: 123,
            num_profiles_sent: 9,
            camera_data: vec![CameraStatusData {
                port: 0,
                temperature: 41,
                pixels_in_window: 800,
            }],
            encoders: vec![100, -5],
            min_scan_period_ns: 1_500_000,
            state: 1,
        });

        let bytes = encode(&msg).unwrap();
        let back: ServerMessage = decode(&bytes).unwrap();
        match back {
            ServerMessage::Status(s) => {
                assert_eq!(s.min_scan_period_ns, 1_500_000);
                assert_eq!(s.encoders, vec![100, -5]);
            }
            other => panic!("wrong message decoded: {:?}", other),
        }
    }

    #[test]
    fn discovery_round_trip() {
        let probe = ClientDiscovery {
            api_version_major: 16,
            api_version_minor: 3,
            api_version_patch: 1,
        };
        let bytes = encode(&probe).unwrap();
        let back: ClientDiscovery = decode(&bytes).unwrap();
        assert_eq!(back.api_version_major, 16);

        let reply = ServerDiscovery {
            serial_number: 12345,
            type_code: 1,
            version_major: 16,
            version_minor: 3,
            version_patch: 1,
            ip_server: u32::from(std::net::Ipv4Addr::new(192, 168, 1, 50)),
            link_speed_mbps: 1000,
            state: 1,
            type_str: "JS-50 WX".into(),
        };
        let bytes = encode(&reply).unwrap();
        let back: ServerDiscovery = decode(&bytes).unwrap();
        assert_eq!(back.serial_number, 12345);
        assert_eq!(back.type_str, "JS-50 WX");
    }

    #[test]
    fn truncated_buffer_fails_decode() {
        let bytes = encode(&ClientMessage::KeepAlive).unwrap();
        let result: Result<ClientMessage> = decode(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
