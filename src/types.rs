use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Client API version advertised during discovery and connect.
pub const API_VERSION: FirmwareVersion = FirmwareVersion {
    major: 16,
    minor: 3,
    patch: 1,
};

/// Number of encoder slots a scan head can be fed from ScanSync devices.
pub const ENCODER_MAX: usize = 3;

/// Maximum number of points in a single profile line.
pub const RAW_PROFILE_DATA_LEN: usize = 1456;

/// Maximum number of points in a filtered profile line.
pub const PROFILE_DATA_LEN: usize = RAW_PROFILE_DATA_LEN;

/// Number of profile records preallocated per scan head.
pub const SCAN_HEAD_PROFILES_MAX: usize = 1000;

/// Sentinel for a point slot with no valid X/Y measurement.
pub const PROFILE_DATA_INVALID_XY: i32 = i32::MIN;

/// Sentinel for a point slot with no valid brightness measurement.
pub const PROFILE_DATA_INVALID_BRIGHTNESS: u16 = 0;

/// Sentinel encoder value for slots beyond `num_encoder_values`.
pub const INVALID_ENCODER_VALUE: i64 = i64::MAX;

/// Serial number value meaning "no ScanSync assigned".
pub const SCANSYNC_INVALID_SERIAL: u32 = 0;

/// Maximum length of a camera image, in pixels.
pub const CAMERA_IMAGE_DATA_MAX_WIDTH: usize = 1456;
pub const CAMERA_IMAGE_DATA_MAX_HEIGHT: usize = 1156;
pub const CAMERA_IMAGE_DATA_LEN: usize =
    CAMERA_IMAGE_DATA_MAX_WIDTH * CAMERA_IMAGE_DATA_MAX_HEIGHT;

/// A semantic firmware or API version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// True if this version is at least `major.minor.patch`.
    pub fn is_compatible(&self, major: u32, minor: u32, patch: u32) -> bool {
        if major != self.major {
            return major < self.major;
        }
        if minor != self.minor {
            return minor < self.minor;
        }
        patch <= self.patch
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::cmp::PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

/// User-facing camera identifier. Devices address cameras by port index;
/// the static model specification translates between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Camera {
    Invalid = 0,
    A = 1,
    B = 2,
}

impl Camera {
    pub fn from_number(n: u32) -> Camera {
        match n {
            1 => Camera::A,
            2 => Camera::B,
            _ => Camera::Invalid,
        }
    }

    pub fn number(&self) -> u32 {
        *self as u32
    }
}

/// User-facing laser identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Laser {
    Invalid = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
    L5 = 5,
    L6 = 6,
    L7 = 7,
    L8 = 8,
}

impl Laser {
    pub fn from_number(n: u32) -> Laser {
        match n {
            1 => Laser::L1,
            2 => Laser::L2,
            3 => Laser::L3,
            4 => Laser::L4,
            5 => Laser::L5,
            6 => Laser::L6,
            7 => Laser::L7,
            8 => Laser::L8,
            _ => Laser::Invalid,
        }
    }

    pub fn number(&self) -> u32 {
        *self as u32
    }
}

/// Encoder slot on a scan head that a ScanSync can be mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Encoder {
    Main = 0,
    Aux1 = 1,
    Aux2 = 2,
}

/// Scan head product variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ScanHeadType {
    Invalid = 0,
    Js50Wx = 1,
    Js50Wsc = 2,
    Js50X6b20 = 3,
    Js50X6b30 = 4,
    Js50Mx = 5,
    Js50Z820 = 6,
    Js50Z830 = 7,
}

/// Device state reported in discovery responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ScanHeadState {
    Invalid = 0,
    Standby = 1,
    Connected = 2,
    Scanning = 3,
}

/// Physical cable install direction. Flips the camera coordinate system
/// by a 180 degree yaw in the alignment transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CableOrientation {
    Upstream,
    Downstream,
}

/// Measurement units for mill-space coordinates and windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Inches,
    Millimeters,
}

/// Requested scan data contents and point density.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Invalid,
    XyBrightnessFull,
    XyBrightnessHalf,
    XyBrightnessQuarter,
    XyFull,
    XyHalf,
    XyQuarter,
}

impl DataFormat {
    /// Point decimation stride for this format; zero for `Invalid`.
    pub fn stride(&self) -> u32 {
        match self {
            DataFormat::XyBrightnessFull | DataFormat::XyFull => 1,
            DataFormat::XyBrightnessHalf | DataFormat::XyHalf => 2,
            DataFormat::XyBrightnessQuarter | DataFormat::XyQuarter => 4,
            DataFormat::Invalid => 0,
        }
    }

    pub fn has_brightness(&self) -> bool {
        matches!(
            self,
            DataFormat::XyBrightnessFull
                | DataFormat::XyBrightnessHalf
                | DataFormat::XyBrightnessQuarter
        )
    }
}

/// Exposure and laser timing configuration applied to a scan head or to a
/// single phase element.
///
/// Invariants: `min <= def <= max` for both the laser on times and the
/// camera exposure times, all within the device specification bounds;
/// thresholds within their fixed ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHeadConfiguration {
    pub laser_on_time_min_us: u32,
    pub laser_on_time_def_us: u32,
    pub laser_on_time_max_us: u32,
    pub camera_exposure_time_min_us: u32,
    pub camera_exposure_time_def_us: u32,
    pub camera_exposure_time_max_us: u32,
    /// 0..=1023
    pub laser_detection_threshold: u32,
    /// 0..=1023
    pub saturation_threshold: u32,
    /// 0..=100
    pub saturation_percentage: u32,
}

impl Default for ScanHeadConfiguration {
    fn default() -> Self {
        Self {
            laser_on_time_min_us: 100,
            laser_on_time_def_us: 500,
            laser_on_time_max_us: 1000,
            camera_exposure_time_min_us: 10_000,
            camera_exposure_time_def_us: 500_000,
            camera_exposure_time_max_us: 1_000_000,
            laser_detection_threshold: 120,
            saturation_threshold: 800,
            saturation_percentage: 30,
        }
    }
}

/// A scan head found by UDP broadcast discovery, with attribution of the
/// client interface that heard the response.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub serial_number: u32,
    pub head_type: ScanHeadType,
    pub firmware_version: FirmwareVersion,
    pub ip_addr: Ipv4Addr,
    pub client_name: String,
    pub client_ip_addr: Ipv4Addr,
    pub client_netmask: Ipv4Addr,
    pub type_str: String,
    pub link_speed_mbps: u32,
    pub state: ScanHeadState,
}

bitflags::bitflags! {
    /// Status flag word broadcast by ScanSync devices (packet v2 onward).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanSyncFlags: u32 {
        const FAULT_A             = 1 << 0;
        const FAULT_B             = 1 << 1;
        const FAULT_Y             = 1 << 2;
        const FAULT_Z             = 1 << 3;
        const OVERRUN             = 1 << 4;
        const TERMINATION_ENABLE  = 1 << 5;
        const INDEX_Z             = 1 << 6;
        const SYNC                = 1 << 7;
        const AUX_Y               = 1 << 8;
        const FAULT_SYNC          = 1 << 9;
        const LASER_DISABLE       = 1 << 10;
        const FAULT_LASER_DISABLE = 1 << 11;
    }
}

impl Default for ScanSyncFlags {
    fn default() -> Self {
        ScanSyncFlags::empty()
    }
}

/// Most recent state broadcast by a ScanSync device.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSyncStatus {
    pub serial_number: u32,
    pub sequence: u32,
    pub timestamp_ns: u64,
    pub encoder: i64,
    pub flags: ScanSyncFlags,
    pub aux_y_timestamp_ns: u64,
    pub index_z_timestamp_ns: u64,
    pub sync_timestamp_ns: u64,
    pub laser_disable_timestamp_ns: u64,
}

impl ScanSyncStatus {
    pub fn is_fault_a(&self) -> bool {
        self.flags.contains(ScanSyncFlags::FAULT_A)
    }

    pub fn is_fault_b(&self) -> bool {
        self.flags.contains(ScanSyncFlags::FAULT_B)
    }

    pub fn is_index_z(&self) -> bool {
        self.flags.contains(ScanSyncFlags::INDEX_Z)
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(ScanSyncFlags::SYNC)
    }

    pub fn is_aux_y(&self) -> bool {
        self.flags.contains(ScanSyncFlags::AUX_Y)
    }

    pub fn is_laser_disable(&self) -> bool {
        self.flags.contains(ScanSyncFlags::LASER_DISABLE)
    }
}

/// A ScanSync device seen on the local network.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSyncDiscovered {
    pub serial_number: u32,
    pub ip_addr: Option<Ipv4Addr>,
    pub firmware_version: FirmwareVersion,
}

/// Fixed capabilities of a scan head variant.
#[derive(Debug, Clone, Copy)]
pub struct ScanHeadCapabilities {
    pub camera_brightness_bit_depth: u32,
    pub max_camera_image_height: u32,
    pub max_camera_image_width: u32,
    pub max_scan_period_us: u32,
    pub min_scan_period_us: u32,
    pub num_cameras: u32,
    pub num_encoders: u32,
    pub num_lasers: u32,
}

/// Cached contents of the last status response from a scan head.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusMessage {
    pub global_time_ns: u64,
    pub num_profiles_sent: u32,
    pub camera_a_pixels_in_window: u32,
    pub camera_a_temp: i32,
    pub camera_b_pixels_in_window: u32,
    pub camera_b_temp: i32,
    pub num_encoder_values: u32,
    pub encoder_values: [i64; ENCODER_MAX],
    pub min_scan_period_us: u32,
}

/// A full camera frame captured through the diagnostic image request.
#[derive(Debug, Clone)]
pub struct CameraImage {
    pub scan_head_id: u32,
    pub camera: Camera,
    pub laser: Laser,
    pub timestamp_ns: u64,
    pub camera_exposure_time_us: u32,
    pub laser_on_time_us: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub num_encoder_values: u32,
    pub encoder_values: [i64; ENCODER_MAX],
    pub data: Vec<u8>,
}

/// A 2D point in mill coordinate space, in the system's configured units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

/// Bit-per-pixel camera pixel rejection mask at maximum camera dimensions.
#[derive(Clone)]
pub struct ExclusionMask {
    pub bitmap: Vec<bool>,
}

impl Default for ExclusionMask {
    fn default() -> Self {
        Self {
            bitmap: vec![false; CAMERA_IMAGE_DATA_LEN],
        }
    }
}

impl ExclusionMask {
    pub fn at(&self, row: usize, column: usize) -> bool {
        self.bitmap[row * CAMERA_IMAGE_DATA_MAX_WIDTH + column]
    }

    pub fn set(&mut self, row: usize, column: usize, excluded: bool) {
        self.bitmap[row * CAMERA_IMAGE_DATA_MAX_WIDTH + column] = excluded;
    }
}

impl std::fmt::Debug for ExclusionMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.bitmap.iter().filter(|b| **b).count();
        f.debug_struct("ExclusionMask")
            .field("pixels_excluded", &set)
            .finish()
    }
}

/// Per-column brightness scale factors plus a scalar offset.
#[derive(Clone)]
pub struct BrightnessCorrection {
    pub offset: f64,
    pub scale_factors: Vec<f64>,
}

impl Default for BrightnessCorrection {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale_factors: vec![1.0; CAMERA_IMAGE_DATA_MAX_WIDTH],
        }
    }
}

impl std::fmt::Debug for BrightnessCorrection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrightnessCorrection")
            .field("offset", &self.offset)
            .field("scale_factors_len", &self.scale_factors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_compatibility_ordering() {
        let v = FirmwareVersion::new(16, 3, 1);
        assert!(v.is_compatible(16, 3, 0));
        assert!(v.is_compatible(16, 3, 1));
        assert!(v.is_compatible(15, 9, 9));
        assert!(!v.is_compatible(16, 3, 2));
        assert!(!v.is_compatible(16, 4, 0));
        assert!(!v.is_compatible(17, 0, 0));
    }

    #[test]
    fn format_strides() {
        assert_eq!(DataFormat::XyBrightnessFull.stride(), 1);
        assert_eq!(DataFormat::XyHalf.stride(), 2);
        assert_eq!(DataFormat::XyBrightnessQuarter.stride(), 4);
        assert_eq!(DataFormat::Invalid.stride(), 0);
        assert!(DataFormat::XyBrightnessHalf.has_brightness());
        assert!(!DataFormat::XyQuarter.has_brightness());
    }

    #[test]
    fn id_number_round_trip() {
        assert_eq!(Camera::from_number(Camera::B.number()), Camera::B);
        assert_eq!(Laser::from_number(Laser::L8.number()), Laser::L8);
        assert_eq!(Camera::from_number(99), Camera::Invalid);
        assert_eq!(Laser::from_number(0), Laser::Invalid);
    }
}
