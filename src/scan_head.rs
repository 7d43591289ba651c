use crate::alignment::{AlignmentParams, Transform};
use crate::error::Error;
use crate::model::ScanHeadModel;
use crate::net::TcpFramedSocket;
use crate::packet::{DataPacket, MAX_DATAGRAM_SIZE};
use crate::profile::{raw_to_profile, Profile, ProfilePoint, RawProfile};
use crate::protocol::{
    self, BrightnessCorrectionData, CameraLaserConfiguration, CameraOrientation, ClientMessage,
    ConnectData, ConstraintData, DataTypeMask, EncoderAssignmentData, ExclusionMaskData,
    ImageRequestData, ProfileRequestData, ScanConfigurationData, ScanStartData, ServerMessage,
    StoreAlignmentData, WindowConfigurationData, MAX_CTRL_RESPONSE_SIZE, SCAN_SERVER_CTRL_PORT,
    SCAN_SERVER_DATA_PORT,
};
use crate::queue::{ProfileQueue, QueueMode};
use crate::types::{
    BrightnessCorrection, CableOrientation, Camera, CameraImage, Coordinate, DataFormat,
    Discovered, ExclusionMask, FirmwareVersion, Laser, ScanHeadCapabilities,
    ScanHeadConfiguration, ScanHeadType, StatusMessage, Units, API_VERSION,
    CAMERA_IMAGE_DATA_MAX_HEIGHT, CAMERA_IMAGE_DATA_MAX_WIDTH, ENCODER_MAX,
    INVALID_ENCODER_VALUE, RAW_PROFILE_DATA_LEN,
};
use crate::window::ScanWindow;
use crate::Result;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// X/Y wire value marking a point the device could not measure.
const INVALID_XY_WIRE: i16 = -32768;

/// One scheduled camera/laser pair with its effective configuration and
/// the offset within the phase cycle at which its scan window closes.
#[derive(Debug, Clone, Copy)]
pub struct ScanPair {
    pub camera: Camera,
    pub laser: Laser,
    pub config: ScanHeadConfiguration,
    pub end_offset_us: u32,
}

/// Per-pair dynamic data resent to the device whenever dirty.
struct DynamicData {
    config: ScanHeadConfiguration,
    config_default: ScanHeadConfiguration,
    alignment: BTreeMap<(Camera, Laser), AlignmentParams>,
    windows: BTreeMap<(Camera, Laser), ScanWindow>,
    exclusion: BTreeMap<(Camera, Laser), ExclusionMask>,
    brightness: BTreeMap<(Camera, Laser), BrightnessCorrection>,
    is_dirty: bool,
}

struct CtrlChannel {
    sock: Option<TcpFramedSocket>,
    status: StatusMessage,
}

/// State shared with the profile receive thread.
struct SessionShared {
    model: ScanHeadModel,
    queue: ProfileQueue,
    is_receive_active: AtomicBool,
    is_scanning: AtomicBool,
    is_frame_scanning: AtomicBool,
    last_sequence: AtomicU32,
    min_encoder_travel: AtomicU32,
    idle_scan_period_ns: AtomicU64,
    format: RwLock<DataFormat>,
    transforms: RwLock<BTreeMap<(Camera, Laser), Transform>>,
    new_data_lock: Mutex<()>,
    new_data_cv: Condvar,
}

/// A per-device session: control channel, dynamic configuration, and the
/// background receive task feeding the profile pool while scanning.
pub struct ScanHead {
    model: ScanHeadModel,
    firmware_version: FirmwareVersion,
    ip_address: Ipv4Addr,
    client_name: String,
    client_ip_address: Ipv4Addr,
    units: Units,
    ctrl: Mutex<CtrlChannel>,
    dynamic: Mutex<DynamicData>,
    scan_pairs: Mutex<Vec<ScanPair>>,
    scan_period_us: AtomicU32,
    shared: Arc<SessionShared>,
    receive_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ScanHead {
    pub(crate) fn new(discovered: &Discovered, id: u32, units: Units) -> Result<Self> {
        let model = ScanHeadModel::new(discovered.head_type, discovered.serial_number, id)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown scan head type for serial {}",
                    discovered.serial_number
                ))
            })?;

        let alignment_scale = match units {
            Units::Inches => 1.0,
            Units::Millimeters => 25.4,
        };

        let mut alignment = BTreeMap::new();
        let mut windows = BTreeMap::new();
        let mut exclusion = BTreeMap::new();
        let mut brightness = BTreeMap::new();
        let mut transforms = BTreeMap::new();
        for pair in model.pairs() {
            let params = AlignmentParams::new(
                alignment_scale,
                0.0,
                0.0,
                0.0,
                CableOrientation::Upstream,
            );
            transforms.insert(pair, *params.transform());
            alignment.insert(pair, params);
            windows.insert(pair, ScanWindow::unconstrained());
            exclusion.insert(pair, ExclusionMask::default());
            brightness.insert(pair, BrightnessCorrection::default());
        }

        let queue = ProfileQueue::new(&model);
        queue.reset(QueueMode::Single);

        let shared = Arc::new(SessionShared {
            model: model.clone(),
            queue,
            is_receive_active: AtomicBool::new(false),
            is_scanning: AtomicBool::new(false),
            is_frame_scanning: AtomicBool::new(false),
            last_sequence: AtomicU32::new(0),
            min_encoder_travel: AtomicU32::new(0),
            idle_scan_period_ns: AtomicU64::new(0),
            format: RwLock::new(DataFormat::XyBrightnessFull),
            transforms: RwLock::new(transforms),
            new_data_lock: Mutex::new(()),
            new_data_cv: Condvar::new(),
        });

        Ok(Self {
            model,
            firmware_version: discovered.firmware_version,
            ip_address: discovered.ip_addr,
            client_name: discovered.client_name.clone(),
            client_ip_address: discovered.client_ip_addr,
            units,
            ctrl: Mutex::new(CtrlChannel {
                sock: None,
                status: StatusMessage::default(),
            }),
            dynamic: Mutex::new(DynamicData {
                config: ScanHeadConfiguration::default(),
                config_default: ScanHeadConfiguration::default(),
                alignment,
                windows,
                exclusion,
                brightness,
                is_dirty: true,
            }),
            scan_pairs: Mutex::new(Vec::new()),
            scan_period_us: AtomicU32::new(0),
            shared,
            receive_thread: Mutex::new(None),
        })
    }

    // -- identity --

    pub fn head_type(&self) -> ScanHeadType {
        self.model.head_type()
    }

    pub fn serial_number(&self) -> u32 {
        self.model.serial_number()
    }

    pub fn id(&self) -> u32 {
        self.model.id()
    }

    pub fn ip_address(&self) -> Ipv4Addr {
        self.ip_address
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.firmware_version
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn capabilities(&self) -> ScanHeadCapabilities {
        let spec = self.model.spec();
        ScanHeadCapabilities {
            camera_brightness_bit_depth: 8,
            max_camera_image_height: spec.max_camera_rows,
            max_camera_image_width: spec.max_camera_columns,
            max_scan_period_us: spec.max_scan_period_us,
            min_scan_period_us: spec.min_scan_period_us,
            num_cameras: spec.number_of_cameras,
            num_encoders: 1,
            num_lasers: spec.number_of_lasers,
        }
    }

    pub fn paired_camera(&self, laser: Laser) -> Camera {
        self.model.paired_camera(laser)
    }

    pub fn paired_laser(&self, camera: Camera) -> Laser {
        self.model.paired_laser(camera)
    }

    pub fn pair_count(&self) -> u32 {
        self.model.pair_count()
    }

    // -- connection lifecycle --

    pub fn is_connected(&self) -> bool {
        match self.ctrl.lock() {
            Ok(ctrl) => ctrl.sock.as_ref().map(|s| s.is_open()).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.is_scanning.load(Ordering::Acquire)
    }

    /// Open the control channel and start the profile receive task.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        {
            let mut ctrl = self.lock_ctrl()?;
            let sock = TcpFramedSocket::connect(
                Some((self.client_name.as_str(), self.client_ip_address)),
                self.ip_address,
                SCAN_SERVER_CTRL_PORT,
                timeout,
            )?;

            let msg = ClientMessage::Connect(ConnectData {
                serial_number: self.serial_number(),
                id: self.id(),
                notes: vec!["Rust API".into(), API_VERSION.to_string()],
            });
            sock.send(&protocol::encode(&msg)?)?;
            ctrl.sock = Some(sock);
        }

        self.request_status()?;

        self.shared.is_receive_active.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let client_name = self.client_name.clone();
        let client_ip = self.client_ip_address;
        let ip = self.ip_address;
        let serial = self.serial_number();

        let thread = std::thread::Builder::new()
            .name(format!("linescan-recv-{}", serial))
            .spawn(move || receive_main(shared, client_name, client_ip, ip, serial))
            .map_err(|e| Error::Internal(format!("failed to spawn receive thread: {}", e)))?;

        if let Ok(mut guard) = self.receive_thread.lock() {
            *guard = Some(thread);
        }

        Ok(())
    }

    /// Stop the receive task, tell the device goodbye, and close the
    /// control channel.
    pub fn disconnect(&self) -> Result<()> {
        self.shared.is_receive_active.store(false, Ordering::Release);
        if let Ok(mut guard) = self.receive_thread.lock() {
            if let Some(thread) = guard.take() {
                let _ = thread.join();
            }
        }

        let result = {
            let mut ctrl = self.lock_ctrl()?;
            let result = match ctrl.sock.as_ref() {
                Some(sock) => sock.send(&protocol::encode(&ClientMessage::Disconnect)?),
                None => Err(Error::NotConnected),
            };
            if let Some(mut sock) = ctrl.sock.take() {
                sock.close();
            }
            result
        };

        self.shared.is_scanning.store(false, Ordering::Release);
        self.shared.new_data_cv.notify_all();

        result
    }

    fn lock_ctrl(&self) -> Result<std::sync::MutexGuard<'_, CtrlChannel>> {
        self.ctrl
            .lock()
            .map_err(|_| Error::Internal("control channel mutex poisoned".into()))
    }

    fn lock_dynamic(&self) -> Result<std::sync::MutexGuard<'_, DynamicData>> {
        self.dynamic
            .lock()
            .map_err(|_| Error::Internal("dynamic data mutex poisoned".into()))
    }

    fn send_ctrl(&self, msg: &ClientMessage) -> Result<()> {
        let ctrl = self.lock_ctrl()?;
        let sock = ctrl.sock.as_ref().ok_or(Error::NotConnected)?;
        sock.send(&protocol::encode(msg)?)
    }

    /// Send a request and read its response under one channel lock.
    fn transact(&self, msg: &ClientMessage, buf: &mut [u8]) -> Result<usize> {
        let mut ctrl = self.lock_ctrl()?;
        let sock = ctrl.sock.as_mut().ok_or(Error::NotConnected)?;
        sock.send(&protocol::encode(msg)?)?;

        let n = sock.read(buf, None)?;
        if n == 0 {
            return Err(Error::Network("no response from scan head".into()));
        }
        Ok(n)
    }

    // -- status --

    /// Request a fresh status message and cache it.
    pub fn request_status(&self) -> Result<StatusMessage> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut buf = vec![0u8; 4096];
        let n = self.transact(&ClientMessage::StatusRequest, &mut buf)?;

        let data = match protocol::decode::<ServerMessage>(&buf[..n])? {
            ServerMessage::Status(data) => data,
            other => {
                return Err(Error::Internal(format!(
                    "unexpected response to status request: {:?}",
                    other
                )))
            }
        };

        let mut status = StatusMessage {
            global_time_ns: data.global_time_ns,
            num_profiles_sent: data.num_profiles_sent,
            min_scan_period_us: data.min_scan_period_ns / 1000,
            ..StatusMessage::default()
        };

        for camera_data in &data.camera_data {
            match self.model.camera_port_to_id(camera_data.port) {
                Camera::A => {
                    status.camera_a_pixels_in_window = camera_data.pixels_in_window;
                    status.camera_a_temp = camera_data.temperature;
                }
                Camera::B => {
                    status.camera_b_pixels_in_window = camera_data.pixels_in_window;
                    status.camera_b_temp = camera_data.temperature;
                }
                Camera::Invalid => {}
            }
        }

        status.num_encoder_values = data.encoders.len().min(ENCODER_MAX) as u32;
        for (n, &value) in data.encoders.iter().take(ENCODER_MAX).enumerate() {
            status.encoder_values[n] = value;
        }

        let mut ctrl = self.lock_ctrl()?;
        ctrl.status = status;
        Ok(status)
    }

    /// Last cached status, without device I/O.
    pub fn last_status(&self) -> StatusMessage {
        self.ctrl
            .lock()
            .map(|ctrl| ctrl.status)
            .unwrap_or_default()
    }

    pub fn clear_status(&self) {
        if let Ok(mut ctrl) = self.ctrl.lock() {
            ctrl.status = StatusMessage::default();
        }
    }

    /// Minimum commandable scan period: the larger of the static limit and
    /// the window-dependent value the device advertises.
    pub fn min_scan_period(&self) -> u32 {
        let advertised = self.last_status().min_scan_period_us;
        advertised.max(self.model.min_scan_period_us())
    }

    // -- configuration --

    pub fn is_configuration_valid(&self, cfg: &ScanHeadConfiguration) -> bool {
        self.model.is_configuration_valid(cfg)
    }

    pub fn set_configuration(&self, cfg: &ScanHeadConfiguration) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        if !self.is_configuration_valid(cfg) {
            return Err(Error::InvalidArgument(
                "configuration out of device bounds".into(),
            ));
        }

        let mut dynamic = self.lock_dynamic()?;
        dynamic.config = *cfg;
        dynamic.is_dirty = true;
        Ok(())
    }

    pub fn configuration(&self) -> ScanHeadConfiguration {
        self.lock_dynamic()
            .map(|d| d.config)
            .unwrap_or_default()
    }

    pub fn configuration_default(&self) -> ScanHeadConfiguration {
        self.lock_dynamic()
            .map(|d| d.config_default)
            .unwrap_or_default()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_dynamic().map(|d| d.is_dirty).unwrap_or(false)
    }

    pub fn clear_dirty(&self) {
        if let Ok(mut dynamic) = self.lock_dynamic() {
            dynamic.is_dirty = false;
        }
    }

    // -- pair resolution for the camera/laser function variants --

    fn camera_pair(&self, camera: Camera) -> Result<(Camera, Laser)> {
        if self.model.is_laser_primary() {
            return Err(Error::UseLaserFunction);
        }
        let laser = self.model.paired_laser(camera);
        if laser == Laser::Invalid {
            return Err(Error::InvalidArgument(format!(
                "camera {:?} has no paired laser",
                camera
            )));
        }
        Ok((camera, laser))
    }

    fn laser_pair(&self, laser: Laser) -> Result<(Camera, Laser)> {
        if self.model.is_camera_primary() {
            return Err(Error::UseCameraFunction);
        }
        let camera = self.model.paired_camera(laser);
        if camera == Camera::Invalid {
            return Err(Error::InvalidArgument(format!(
                "laser {:?} has no paired camera",
                laser
            )));
        }
        Ok((camera, laser))
    }

    // -- alignment --

    fn set_alignment_pair(
        &self,
        camera: Camera,
        laser: Laser,
        roll: f64,
        shift_x: f64,
        shift_y: f64,
    ) -> Result<()> {
        let mut dynamic = self.lock_dynamic()?;
        let params = dynamic
            .alignment
            .get_mut(&(camera, laser))
            .ok_or_else(|| Error::InvalidArgument(format!("pair {:?}/{:?}", camera, laser)))?;
        params.set_roll_and_offset(roll, shift_x, shift_y);
        dynamic.is_dirty = true;
        drop(dynamic);

        self.publish_transforms()
    }

    /// Apply the same alignment to every pair of the head.
    pub fn set_alignment(&self, roll: f64, shift_x: f64, shift_y: f64) -> Result<()> {
        for (camera, laser) in self.model.pairs() {
            self.set_alignment_pair(camera, laser, roll, shift_x, shift_y)?;
        }
        Ok(())
    }

    pub fn set_alignment_camera(
        &self,
        camera: Camera,
        roll: f64,
        shift_x: f64,
        shift_y: f64,
    ) -> Result<()> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.set_alignment_pair(camera, laser, roll, shift_x, shift_y)
    }

    pub fn set_alignment_laser(
        &self,
        laser: Laser,
        roll: f64,
        shift_x: f64,
        shift_y: f64,
    ) -> Result<()> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.set_alignment_pair(camera, laser, roll, shift_x, shift_y)
    }

    fn alignment_pair(&self, camera: Camera, laser: Laser) -> Result<(f64, f64, f64)> {
        let dynamic = self.lock_dynamic()?;
        let params = dynamic
            .alignment
            .get(&(camera, laser))
            .ok_or_else(|| Error::InvalidArgument(format!("pair {:?}/{:?}", camera, laser)))?;
        let a = params.alignment();
        Ok((a.roll, a.shift_x, a.shift_y))
    }

    pub fn alignment_camera(&self, camera: Camera) -> Result<(f64, f64, f64)> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.alignment_pair(camera, laser)
    }

    pub fn alignment_laser(&self, laser: Laser) -> Result<(f64, f64, f64)> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.alignment_pair(camera, laser)
    }

    pub fn set_cable_orientation(&self, cable: CableOrientation) -> Result<()> {
        let mut dynamic = self.lock_dynamic()?;
        for params in dynamic.alignment.values_mut() {
            params.set_cable_orientation(cable);
        }
        dynamic.is_dirty = true;
        drop(dynamic);

        self.publish_transforms()
    }

    pub fn cable_orientation(&self) -> CableOrientation {
        self.lock_dynamic()
            .ok()
            .and_then(|d| d.alignment.values().next().map(|p| p.alignment().cable))
            .unwrap_or(CableOrientation::Upstream)
    }

    /// Push the current per-pair transforms to the receive task.
    fn publish_transforms(&self) -> Result<()> {
        let dynamic = self.lock_dynamic()?;
        let mut transforms = self
            .shared
            .transforms
            .write()
            .map_err(|_| Error::Internal("transform lock poisoned".into()))?;
        for (pair, params) in &dynamic.alignment {
            transforms.insert(*pair, *params.transform());
        }
        Ok(())
    }

    // -- scan window --

    fn set_window_pair(&self, camera: Camera, laser: Laser, window: &ScanWindow) -> Result<()> {
        let mut dynamic = self.lock_dynamic()?;
        if !dynamic.windows.contains_key(&(camera, laser)) {
            return Err(Error::InvalidArgument(format!(
                "pair {:?}/{:?}",
                camera, laser
            )));
        }
        dynamic.windows.insert((camera, laser), window.clone());
        dynamic.is_dirty = true;
        Ok(())
    }

    pub fn set_window(&self, window: &ScanWindow) -> Result<()> {
        for (camera, laser) in self.model.pairs() {
            self.set_window_pair(camera, laser, window)?;
        }
        Ok(())
    }

    pub fn set_window_camera(&self, camera: Camera, window: &ScanWindow) -> Result<()> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.set_window_pair(camera, laser, window)
    }

    pub fn set_window_laser(&self, laser: Laser, window: &ScanWindow) -> Result<()> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.set_window_pair(camera, laser, window)
    }

    pub fn set_polygon_window(&self, points: &[Coordinate]) -> Result<()> {
        let window = ScanWindow::polygon(points)?;
        self.set_window(&window)
    }

    pub fn set_polygon_window_camera(&self, camera: Camera, points: &[Coordinate]) -> Result<()> {
        let window = ScanWindow::polygon(points)?;
        self.set_window_camera(camera, &window)
    }

    pub fn set_polygon_window_laser(&self, laser: Laser, points: &[Coordinate]) -> Result<()> {
        let window = ScanWindow::polygon(points)?;
        self.set_window_laser(laser, &window)
    }

    pub fn window_camera(&self, camera: Camera) -> Result<ScanWindow> {
        let (camera, laser) = self.camera_pair(camera)?;
        let dynamic = self.lock_dynamic()?;
        Ok(dynamic.windows[&(camera, laser)].clone())
    }

    pub fn window_laser(&self, laser: Laser) -> Result<ScanWindow> {
        let (camera, laser) = self.laser_pair(laser)?;
        let dynamic = self.lock_dynamic()?;
        Ok(dynamic.windows[&(camera, laser)].clone())
    }

    // -- exclusion mask / brightness correction --

    fn set_exclusion_mask_pair(
        &self,
        camera: Camera,
        laser: Laser,
        mask: &ExclusionMask,
    ) -> Result<()> {
        let mut dynamic = self.lock_dynamic()?;
        if !dynamic.exclusion.contains_key(&(camera, laser)) {
            return Err(Error::InvalidArgument(format!(
                "pair {:?}/{:?}",
                camera, laser
            )));
        }
        dynamic.exclusion.insert((camera, laser), mask.clone());
        dynamic.is_dirty = true;
        Ok(())
    }

    pub fn set_exclusion_mask(&self, mask: &ExclusionMask) -> Result<()> {
        for (camera, laser) in self.model.pairs() {
            self.set_exclusion_mask_pair(camera, laser, mask)?;
        }
        Ok(())
    }

    pub fn set_exclusion_mask_camera(&self, camera: Camera, mask: &ExclusionMask) -> Result<()> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.set_exclusion_mask_pair(camera, laser, mask)
    }

    pub fn set_exclusion_mask_laser(&self, laser: Laser, mask: &ExclusionMask) -> Result<()> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.set_exclusion_mask_pair(camera, laser, mask)
    }

    pub fn exclusion_mask_camera(&self, camera: Camera) -> Result<ExclusionMask> {
        let (camera, laser) = self.camera_pair(camera)?;
        let dynamic = self.lock_dynamic()?;
        Ok(dynamic.exclusion[&(camera, laser)].clone())
    }

    pub fn exclusion_mask_laser(&self, laser: Laser) -> Result<ExclusionMask> {
        let (camera, laser) = self.laser_pair(laser)?;
        let dynamic = self.lock_dynamic()?;
        Ok(dynamic.exclusion[&(camera, laser)].clone())
    }

    fn set_brightness_correction_pair(
        &self,
        camera: Camera,
        laser: Laser,
        correction: &BrightnessCorrection,
    ) -> Result<()> {
        let mut dynamic = self.lock_dynamic()?;
        if !dynamic.brightness.contains_key(&(camera, laser)) {
            return Err(Error::InvalidArgument(format!(
                "pair {:?}/{:?}",
                camera, laser
            )));
        }
        dynamic.brightness.insert((camera, laser), correction.clone());
        dynamic.is_dirty = true;
        Ok(())
    }

    pub fn set_brightness_correction_camera(
        &self,
        camera: Camera,
        correction: &BrightnessCorrection,
    ) -> Result<()> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.set_brightness_correction_pair(camera, laser, correction)
    }

    pub fn set_brightness_correction_laser(
        &self,
        laser: Laser,
        correction: &BrightnessCorrection,
    ) -> Result<()> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.set_brightness_correction_pair(camera, laser, correction)
    }

    pub fn brightness_correction_camera(&self, camera: Camera) -> Result<BrightnessCorrection> {
        let (camera, laser) = self.camera_pair(camera)?;
        let dynamic = self.lock_dynamic()?;
        Ok(dynamic.brightness[&(camera, laser)].clone())
    }

    pub fn brightness_correction_laser(&self, laser: Laser) -> Result<BrightnessCorrection> {
        let (camera, laser) = self.laser_pair(laser)?;
        let dynamic = self.lock_dynamic()?;
        Ok(dynamic.brightness[&(camera, laser)].clone())
    }

    // -- encoder travel gate --

    pub fn minimum_encoder_travel(&self) -> u32 {
        self.shared.min_encoder_travel.load(Ordering::Relaxed)
    }

    pub fn set_minimum_encoder_travel(&self, travel: u32) {
        self.shared
            .min_encoder_travel
            .store(travel, Ordering::Relaxed);
    }

    pub fn idle_scan_period_us(&self) -> u32 {
        (self.shared.idle_scan_period_ns.load(Ordering::Relaxed) / 1000) as u32
    }

    pub fn set_idle_scan_period_us(&self, period_us: u32) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        self.shared
            .idle_scan_period_ns
            .store(period_us as u64 * 1000, Ordering::Relaxed);
        Ok(())
    }

    // -- scan pairs --

    pub fn reset_scan_pairs(&self) {
        if let Ok(mut pairs) = self.scan_pairs.lock() {
            pairs.clear();
        }
    }

    pub fn add_scan_pair(
        &self,
        camera: Camera,
        laser: Laser,
        config: ScanHeadConfiguration,
        end_offset_us: u32,
    ) -> Result<()> {
        if !self.model.is_pair_valid(camera, laser) {
            return Err(Error::InvalidArgument(format!(
                "pair {:?}/{:?} not valid for head {}",
                camera,
                laser,
                self.id()
            )));
        }
        if !self.is_configuration_valid(&config) {
            return Err(Error::InvalidArgument(
                "scan pair configuration out of device bounds".into(),
            ));
        }

        let mut pairs = self
            .scan_pairs
            .lock()
            .map_err(|_| Error::Internal("scan pair mutex poisoned".into()))?;
        if pairs.len() as u32 >= self.model.max_scan_pairs() {
            return Err(Error::Internal(format!(
                "scan pair count exceeds {} for head {}",
                self.model.max_scan_pairs(),
                self.id()
            )));
        }

        pairs.push(ScanPair {
            camera,
            laser,
            config,
            end_offset_us,
        });
        Ok(())
    }

    pub fn scan_pairs_count(&self) -> u32 {
        self.scan_pairs.lock().map(|p| p.len() as u32).unwrap_or(0)
    }

    pub fn max_scan_pairs(&self) -> u32 {
        self.model.max_scan_pairs()
    }

    // -- device sends --

    /// Send the scan configuration for the upcoming scan.
    pub(crate) fn send_scan_configuration(
        &self,
        period_us: u32,
        format: DataFormat,
        is_frame_scanning: bool,
    ) -> Result<()> {
        let pairs = self
            .scan_pairs
            .lock()
            .map_err(|_| Error::Internal("scan pair mutex poisoned".into()))?
            .clone();
        if pairs.is_empty() {
            return Ok(());
        }

        if period_us > self.model.max_scan_period_us()
            || period_us < self.model.min_scan_period_us()
        {
            return Err(Error::InvalidArgument(format!(
                "scan period {}us outside device limits",
                period_us
            )));
        }

        if is_frame_scanning && !self.firmware_version.is_compatible(16, 2, 0) {
            return Err(Error::VersionCompatibility(format!(
                "frame scanning requires firmware v16.2.0, head {} runs v{}",
                self.serial_number(),
                self.firmware_version
            )));
        }

        let mut mask = DataTypeMask::XY;
        if format.has_brightness() {
            mask |= DataTypeMask::BRIGHTNESS;
        }
        let data_stride = format.stride();
        if data_stride == 0 {
            return Err(Error::InvalidArgument("invalid data format".into()));
        }

        let (config, orientations) = {
            let dynamic = self.lock_dynamic()?;
            let orientations: Vec<CameraOrientation> = pairs
                .iter()
                .map(|pair| {
                    let cable = dynamic
                        .alignment
                        .get(&(pair.camera, pair.laser))
                        .map(|p| p.alignment().cable)
                        .unwrap_or(CableOrientation::Upstream);
                    self.camera_orientation(pair.camera, cable)
                })
                .collect();
            (dynamic.config, orientations)
        };

        let mut cfg = ScanConfigurationData {
            data_type_mask: mask.bits(),
            data_stride,
            scan_period_ns: period_us * 1000,
            laser_detection_threshold: config.laser_detection_threshold,
            saturation_threshold: config.saturation_threshold,
            saturation_percent: config.saturation_percentage,
            camera_laser_configurations: Vec::with_capacity(pairs.len()),
        };

        for (pair, orientation) in pairs.iter().zip(orientations) {
            let camera_port = self
                .model
                .camera_id_to_port(pair.camera)
                .ok_or_else(|| Error::Internal("scan pair camera has no port".into()))?;
            let laser_port = self
                .model
                .laser_id_to_port(pair.laser)
                .ok_or_else(|| Error::Internal("scan pair laser has no port".into()))?;

            cfg.camera_laser_configurations.push(CameraLaserConfiguration {
                camera_port,
                laser_port,
                laser_on_time_min_ns: pair.config.laser_on_time_min_us * 1000,
                laser_on_time_def_ns: pair.config.laser_on_time_def_us * 1000,
                laser_on_time_max_ns: pair.config.laser_on_time_max_us * 1000,
                scan_end_offset_ns: pair.end_offset_us * 1000,
                camera_orientation: orientation,
            });
        }

        self.send_ctrl(&ClientMessage::ScanConfiguration(cfg))?;

        if let Ok(mut fmt) = self.shared.format.write() {
            *fmt = format;
        }
        self.scan_period_us.store(period_us, Ordering::Relaxed);

        Ok(())
    }

    /// Scan period most recently configured on this head.
    pub fn scan_period(&self) -> u32 {
        self.scan_period_us.load(Ordering::Relaxed)
    }

    fn camera_orientation(&self, camera: Camera, cable: CableOrientation) -> CameraOrientation {
        let camera_port = self.model.camera_id_to_port(camera).unwrap_or(u32::MAX);
        if self.model.camera_port_cable_upstream() == camera_port {
            match cable {
                CableOrientation::Upstream => CameraOrientation::Upstream,
                CableOrientation::Downstream => CameraOrientation::Downstream,
            }
        } else {
            match cable {
                CableOrientation::Upstream => CameraOrientation::Downstream,
                CableOrientation::Downstream => CameraOrientation::Upstream,
            }
        }
    }

    /// Store non-identity alignments on the device, one message per pair.
    pub(crate) fn send_scan_alignment(&self) -> Result<()> {
        let pairs = self
            .scan_pairs
            .lock()
            .map_err(|_| Error::Internal("scan pair mutex poisoned".into()))?
            .clone();
        if pairs.is_empty() {
            return Ok(());
        }

        for pair in pairs {
            let (roll, shift_x, shift_y, identity) = {
                let dynamic = self.lock_dynamic()?;
                match dynamic.alignment.get(&(pair.camera, pair.laser)) {
                    Some(params) => {
                        let a = params.alignment();
                        (a.roll, a.shift_x, a.shift_y, params.is_identity())
                    }
                    None => continue,
                }
            };
            if identity {
                continue;
            }

            let camera_port = self
                .model
                .camera_id_to_port(pair.camera)
                .ok_or_else(|| Error::Internal("scan pair camera has no port".into()))?;
            let laser_port = self
                .model
                .laser_id_to_port(pair.laser)
                .ok_or_else(|| Error::Internal("scan pair laser has no port".into()))?;

            let timestamp_s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            self.send_ctrl(&ClientMessage::StoreAlignment(StoreAlignmentData {
                camera_port,
                laser_port,
                x_offset: shift_x,
                y_offset: shift_y,
                roll,
                fit_error: 0.0,
                timestamp_s,
                notes: vec!["Rust API".into(), API_VERSION.to_string()],
            }))?;
        }

        Ok(())
    }

    pub(crate) fn send_keep_alive(&self) -> Result<()> {
        self.send_ctrl(&ClientMessage::KeepAlive)
    }

    pub(crate) fn send_heart_beat(&self) -> Result<()> {
        self.send_ctrl(&ClientMessage::HeartBeat)
    }

    /// Send the window of every pair to the device.
    pub(crate) fn send_window(&self) -> Result<()> {
        for (camera, laser) in self.model.pairs() {
            self.send_window_pair(camera, laser)?;
        }
        Ok(())
    }

    fn send_window_pair(&self, camera: Camera, laser: Laser) -> Result<()> {
        let camera_port = self
            .model
            .camera_id_to_port(camera)
            .ok_or_else(|| Error::Internal("window camera has no port".into()))?;
        let laser_port = self
            .model
            .laser_id_to_port(laser)
            .ok_or_else(|| Error::Internal("window laser has no port".into()))?;

        let constraints = {
            let dynamic = self.lock_dynamic()?;
            let params = dynamic
                .alignment
                .get(&(camera, laser))
                .ok_or_else(|| Error::Internal("window pair has no alignment".into()))?;
            let cable = params.alignment().cable;
            let transform = *params.transform();
            let window = dynamic
                .windows
                .get(&(camera, laser))
                .ok_or_else(|| Error::Internal("window pair missing".into()))?;

            window
                .constraints()
                .iter()
                .map(|c| {
                    // Constraint points move from mill space to this pair's
                    // camera space; the point order encodes which side of
                    // the segment is kept, so it follows the cable flip.
                    let p0 = transform.mill_to_camera(c.x0 as i32, c.y0 as i32);
                    let p1 = transform.mill_to_camera(c.x1 as i32, c.y1 as i32);
                    if cable == CableOrientation::Downstream {
                        ConstraintData {
                            x0: p0.0 as i64,
                            y0: p0.1 as i64,
                            x1: p1.0 as i64,
                            y1: p1.1 as i64,
                        }
                    } else {
                        ConstraintData {
                            x0: p1.0 as i64,
                            y0: p1.1 as i64,
                            x1: p0.0 as i64,
                            y1: p0.1 as i64,
                        }
                    }
                })
                .collect()
        };

        self.send_ctrl(&ClientMessage::WindowConfiguration(WindowConfigurationData {
            camera_port,
            laser_port,
            constraints,
        }))
    }

    /// Send every pair's exclusion mask. Quietly skipped on firmware that
    /// predates the message.
    pub(crate) fn send_exclusion_mask(&self) -> Result<()> {
        if !self.firmware_version.is_compatible(16, 1, 0) {
            return Ok(());
        }

        for (camera, laser) in self.model.pairs() {
            self.send_exclusion_mask_pair(camera, laser)?;
        }
        Ok(())
    }

    fn send_exclusion_mask_pair(&self, camera: Camera, laser: Laser) -> Result<()> {
        let camera_port = self
            .model
            .camera_id_to_port(camera)
            .ok_or_else(|| Error::InvalidArgument(format!("camera {:?}", camera)))?;
        let laser_port = self
            .model
            .laser_id_to_port(laser)
            .ok_or_else(|| Error::InvalidArgument(format!("laser {:?}", laser)))?;

        let mask = {
            let dynamic = self.lock_dynamic()?;
            let mask = dynamic
                .exclusion
                .get(&(camera, laser))
                .ok_or_else(|| Error::InvalidArgument(format!("pair {:?}/{:?}", camera, laser)))?;

            // Pack MSB-first, row-major over the full camera dimensions.
            let mut packed = Vec::with_capacity(
                CAMERA_IMAGE_DATA_MAX_HEIGHT * CAMERA_IMAGE_DATA_MAX_WIDTH / 8,
            );
            let mut byte = 0u8;
            let mut bit = 0u32;
            for row in 0..CAMERA_IMAGE_DATA_MAX_HEIGHT {
                for column in 0..CAMERA_IMAGE_DATA_MAX_WIDTH {
                    if mask.at(row, column) {
                        byte |= 1 << (7 - bit);
                    }
                    bit += 1;
                    if bit == 8 {
                        packed.push(byte);
                        byte = 0;
                        bit = 0;
                    }
                }
            }
            if bit != 0 {
                packed.push(byte);
            }
            packed
        };

        self.send_ctrl(&ClientMessage::ExclusionMask(ExclusionMaskData {
            camera_port,
            laser_port,
            mask,
        }))
    }

    /// Send every pair's brightness correction; version-gated like the
    /// exclusion mask.
    pub(crate) fn send_brightness_correction(&self) -> Result<()> {
        if !self.firmware_version.is_compatible(16, 1, 0) {
            return Ok(());
        }

        for (camera, laser) in self.model.pairs() {
            self.send_brightness_correction_pair(camera, laser)?;
        }
        Ok(())
    }

    fn send_brightness_correction_pair(&self, camera: Camera, laser: Laser) -> Result<()> {
        let camera_port = self
            .model
            .camera_id_to_port(camera)
            .ok_or_else(|| Error::InvalidArgument(format!("camera {:?}", camera)))?;
        let laser_port = self
            .model
            .laser_id_to_port(laser)
            .ok_or_else(|| Error::InvalidArgument(format!("laser {:?}", laser)))?;

        let (image_offset, scale_factors) = {
            let dynamic = self.lock_dynamic()?;
            let correction = dynamic
                .brightness
                .get(&(camera, laser))
                .ok_or_else(|| Error::InvalidArgument(format!("pair {:?}/{:?}", camera, laser)))?;
            (correction.offset, correction.scale_factors.clone())
        };

        self.send_ctrl(&ClientMessage::BrightnessCorrection(BrightnessCorrectionData {
            camera_port,
            laser_port,
            image_offset,
            scale_factors,
        }))
    }

    /// Map ScanSync serials onto the head's encoder slots. Requires
    /// firmware 16.3.0.
    pub(crate) fn send_encoders(
        &self,
        serial_main: u32,
        serial_aux1: u32,
        serial_aux2: u32,
    ) -> Result<()> {
        if !self.firmware_version.is_compatible(16, 3, 0) {
            return Err(Error::VersionCompatibility(format!(
                "encoder assignment requires firmware v16.3.0, head {} runs v{}",
                self.serial_number(),
                self.firmware_version
            )));
        }

        self.send_ctrl(&ClientMessage::EncoderAssignment(EncoderAssignmentData {
            serial_main,
            serial_aux1,
            serial_aux2,
        }))
    }

    /// Ask the head which ScanSyncs it currently hears. Requires firmware
    /// 16.3.0.
    pub(crate) fn request_scansync_serials(&self) -> Result<Vec<u32>> {
        if !self.firmware_version.is_compatible(16, 3, 0) {
            return Err(Error::VersionCompatibility(format!(
                "ScanSync status requires firmware v16.3.0, head {} runs v{}",
                self.serial_number(),
                self.firmware_version
            )));
        }

        let mut buf = vec![0u8; 4096];
        let n = self.transact(&ClientMessage::ScanSyncStatusRequest, &mut buf)?;
        match protocol::decode::<ServerMessage>(&buf[..n])? {
            ServerMessage::ScanSyncStatus(data) => Ok(data.serials),
            other => Err(Error::Internal(format!(
                "unexpected response to ScanSync status request: {:?}",
                other
            ))),
        }
    }

    // -- scanning --

    pub(crate) fn start_scanning(&self, start_time_ns: u64, is_frame_scanning: bool) -> Result<()> {
        self.shared.queue.reset(if is_frame_scanning {
            QueueMode::Multi
        } else {
            QueueMode::Single
        });
        self.shared.last_sequence.store(0, Ordering::Release);

        let msg = if start_time_ns != 0 {
            ClientMessage::ScanStart(Some(ScanStartData { start_time_ns }))
        } else {
            // Leave the start time to the device's own clock.
            ClientMessage::ScanStart(None)
        };
        self.send_ctrl(&msg)?;

        self.shared
            .is_frame_scanning
            .store(is_frame_scanning, Ordering::Release);
        self.shared.is_scanning.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn stop_scanning(&self) -> Result<()> {
        self.send_ctrl(&ClientMessage::ScanStop)?;
        self.shared.is_scanning.store(false, Ordering::Release);
        self.shared.new_data_cv.notify_all();
        Ok(())
    }

    pub fn is_frame_scanning(&self) -> bool {
        self.shared.is_frame_scanning.load(Ordering::Acquire)
    }

    // -- single-shot diagnostics --

    /// Capture one camera frame through the control channel. Invalidates
    /// the window data held by the device, so dynamic data is re-sent
    /// before the next scan.
    pub fn image_camera(
        &self,
        camera: Camera,
        camera_exposure_us: u32,
        laser_on_time_us: u32,
    ) -> Result<CameraImage> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.image_pair(camera, laser, camera_exposure_us, laser_on_time_us)
    }

    pub fn image_laser(
        &self,
        laser: Laser,
        camera_exposure_us: u32,
        laser_on_time_us: u32,
    ) -> Result<CameraImage> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.image_pair(camera, laser, camera_exposure_us, laser_on_time_us)
    }

    pub fn image_pair(
        &self,
        camera: Camera,
        laser: Laser,
        camera_exposure_us: u32,
        laser_on_time_us: u32,
    ) -> Result<CameraImage> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        let camera_port = self
            .model
            .camera_id_to_port(camera)
            .ok_or_else(|| Error::InvalidArgument(format!("camera {:?}", camera)))?;
        let laser_port = self
            .model
            .laser_id_to_port(laser)
            .ok_or_else(|| Error::InvalidArgument(format!("laser {:?}", laser)))?;

        // Imaging invalidates window data on the device.
        if let Ok(mut dynamic) = self.lock_dynamic() {
            dynamic.is_dirty = true;
        }

        let mut buf = vec![0u8; MAX_CTRL_RESPONSE_SIZE];
        let n = self.transact(
            &ClientMessage::ImageRequest(ImageRequestData {
                camera_port,
                laser_port,
                camera_exposure_ns: camera_exposure_us * 1000,
                laser_on_time_ns: laser_on_time_us * 1000,
            }),
            &mut buf,
        )?;

        let data = match protocol::decode::<ServerMessage>(&buf[..n])? {
            ServerMessage::Image(data) => data,
            other => {
                return Err(Error::Internal(format!(
                    "unexpected response to image request: {:?}",
                    other
                )))
            }
        };

        if data.pixels.len() != (data.width * data.height) as usize
            || data.encoders.len() > ENCODER_MAX
        {
            return Err(Error::Internal("malformed image response".into()));
        }

        let mut encoder_values = [INVALID_ENCODER_VALUE; ENCODER_MAX];
        for (n, &value) in data.encoders.iter().enumerate() {
            encoder_values[n] = value;
        }

        Ok(CameraImage {
            scan_head_id: self.id(),
            camera: self.model.camera_port_to_id(data.camera_port),
            laser: self.model.laser_port_to_id(data.laser_port),
            timestamp_ns: data.timestamp_ns,
            camera_exposure_time_us: camera_exposure_us,
            laser_on_time_us,
            image_width: data.width,
            image_height: data.height,
            num_encoder_values: data.encoders.len() as u32,
            encoder_values,
            data: data.pixels,
        })
    }

    /// Capture one profile synchronously through the control channel.
    pub fn profile_camera(
        &self,
        camera: Camera,
        camera_exposure_us: u32,
        laser_on_time_us: u32,
    ) -> Result<Box<RawProfile>> {
        let (camera, laser) = self.camera_pair(camera)?;
        self.profile_pair(camera, laser, camera_exposure_us, laser_on_time_us)
    }

    pub fn profile_laser(
        &self,
        laser: Laser,
        camera_exposure_us: u32,
        laser_on_time_us: u32,
    ) -> Result<Box<RawProfile>> {
        let (camera, laser) = self.laser_pair(laser)?;
        self.profile_pair(camera, laser, camera_exposure_us, laser_on_time_us)
    }

    pub fn profile_pair(
        &self,
        camera: Camera,
        laser: Laser,
        camera_exposure_us: u32,
        laser_on_time_us: u32,
    ) -> Result<Box<RawProfile>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        let camera_port = self
            .model
            .camera_id_to_port(camera)
            .ok_or_else(|| Error::InvalidArgument(format!("camera {:?}", camera)))?;
        let laser_port = self
            .model
            .laser_id_to_port(laser)
            .ok_or_else(|| Error::InvalidArgument(format!("laser {:?}", laser)))?;

        let (config, cable) = {
            let dynamic = self.lock_dynamic()?;
            let cable = dynamic
                .alignment
                .get(&(camera, laser))
                .map(|p| p.alignment().cable)
                .unwrap_or(CableOrientation::Upstream);
            (dynamic.config, cable)
        };

        let mut buf = vec![0u8; 0x8000];
        let n = self.transact(
            &ClientMessage::ProfileRequest(ProfileRequestData {
                camera_port,
                laser_port,
                camera_exposure_ns: camera_exposure_us * 1000,
                laser_on_time_ns: laser_on_time_us * 1000,
                laser_detection_threshold: config.laser_detection_threshold,
                saturation_threshold: config.saturation_threshold,
                camera_orientation: self.camera_orientation(camera, cable),
            }),
            &mut buf,
        )?;

        let data = match protocol::decode::<ServerMessage>(&buf[..n])? {
            ServerMessage::Profile(data) => data,
            other => {
                return Err(Error::Internal(format!(
                    "unexpected response to profile request: {:?}",
                    other
                )))
            }
        };

        if data.encoders.len() > ENCODER_MAX || data.points.len() > RAW_PROFILE_DATA_LEN {
            return Err(Error::Internal("malformed profile response".into()));
        }

        let camera = self.model.camera_port_to_id(data.camera_port);
        let laser = self.model.laser_port_to_id(data.laser_port);
        let transform = self.transform_for(camera, laser)?;

        let mut raw = Box::new(RawProfile::new());
        raw.scan_head_id = self.id();
        raw.camera = camera;
        raw.laser = laser;
        raw.timestamp_ns = data.timestamp_ns;
        raw.laser_on_time_us = data.laser_on_time_ns / 1000;
        raw.num_encoder_values = data.encoders.len() as u32;
        raw.data_valid_xy = data.valid_points;
        raw.data_valid_brightness = data.valid_points;

        for (n, &value) in data.encoders.iter().enumerate() {
            raw.encoder_values[n] = value;
        }

        for (n, point) in data.points.iter().enumerate() {
            if point.x != INVALID_XY_WIRE && point.y != INVALID_XY_WIRE {
                let (x, y) = transform.camera_to_mill(point.x as i32, point.y as i32);
                raw.data[n] = ProfilePoint {
                    x,
                    y,
                    brightness: point.brightness,
                };
            }
        }
        raw.data_len = data.points.len() as u32;

        Ok(raw)
    }

    fn transform_for(&self, camera: Camera, laser: Laser) -> Result<Transform> {
        let transforms = self
            .shared
            .transforms
            .read()
            .map_err(|_| Error::Internal("transform lock poisoned".into()))?;
        transforms
            .get(&(camera, laser))
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("pair {:?}/{:?}", camera, laser)))
    }

    // -- profile draining --

    pub fn available_profiles(&self) -> u32 {
        self.shared.queue.size_ready()
    }

    /// Block until at least `count` profiles are ready, scanning stops, or
    /// the timeout passes. Returns the number of ready profiles.
    pub fn wait_until_available_profiles(&self, count: u32, timeout: Duration) -> u32 {
        if self.is_scanning() {
            if let Ok(guard) = self.shared.new_data_lock.lock() {
                let shared = &self.shared;
                let _ = self.shared.new_data_cv.wait_timeout_while(guard, timeout, |_| {
                    !(shared.queue.size_ready() >= count
                        || !shared.is_scanning.load(Ordering::Acquire))
                });
            }
        }

        self.shared.queue.size_ready()
    }

    /// Drain ready profiles into `out`, returning how many were written.
    pub fn profiles(&self, out: &mut [RawProfile]) -> usize {
        let mut count = 0;
        while count < out.len() {
            match self.shared.queue.dequeue_ready() {
                Some(raw) => {
                    out[count].clone_from(&raw);
                    self.shared.queue.enqueue_free(raw);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Drain ready profiles in filtered form.
    pub fn profiles_filtered(&self, out: &mut [Profile]) -> usize {
        let mut count = 0;
        while count < out.len() {
            match self.shared.queue.dequeue_ready() {
                Some(raw) => {
                    raw_to_profile(&raw, &mut out[count]);
                    self.shared.queue.enqueue_free(raw);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Flush all buffered profiles.
    pub fn clear_profiles(&self) {
        let mode = if self.is_frame_scanning() {
            QueueMode::Multi
        } else {
            QueueMode::Single
        };
        self.shared.queue.reset(mode);
    }

    pub fn last_sequence_number(&self) -> u32 {
        self.shared.last_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn queue(&self) -> &ProfileQueue {
        &self.shared.queue
    }

    // -- frame assembly --

    /// Fill this head's slots of one frame, in the model's pair order
    /// (reversed for a downstream cable). Returns `(slots_written,
    /// slots_present)`.
    pub(crate) fn fill_frame_slots_raw(
        &self,
        dst: &mut [RawProfile],
        frame_sequence: u32,
    ) -> (usize, usize) {
        let mut pairs = self.model.pairs();
        if self.cable_orientation() == CableOrientation::Downstream {
            pairs.reverse();
        }

        let queue = &self.shared.queue;
        let mut written = 0;
        let mut present = 0;

        for (camera, laser) in pairs {
            if written >= dst.len() {
                break;
            }

            loop {
                match queue.ready_peek_sequence(camera, laser) {
                    None => {
                        Self::invalid_slot(&mut dst[written], self.id(), camera, laser, frame_sequence);
                        written += 1;
                        break;
                    }
                    Some(seq) if seq > frame_sequence => {
                        // Profile belongs to a future frame; leave it queued.
                        Self::invalid_slot(&mut dst[written], self.id(), camera, laser, frame_sequence);
                        written += 1;
                        break;
                    }
                    Some(seq) if seq < frame_sequence => {
                        // Late profile from a frame already emitted; recycle
                        // it without returning it to the caller.
                        if let Some(raw) = queue.dequeue_ready_pair(camera, laser) {
                            queue.enqueue_free_pair(camera, laser, raw);
                        }
                    }
                    Some(_) => {
                        match queue.dequeue_ready_pair(camera, laser) {
                            Some(raw) => {
                                dst[written].clone_from(&raw);
                                queue.enqueue_free_pair(camera, laser, raw);
                                written += 1;
                                present += 1;
                            }
                            None => {
                                Self::invalid_slot(
                                    &mut dst[written],
                                    self.id(),
                                    camera,
                                    laser,
                                    frame_sequence,
                                );
                                written += 1;
                            }
                        }
                        break;
                    }
                }
            }
        }

        (written, present)
    }

    /// Filtered-profile variant of [`fill_frame_slots_raw`].
    pub(crate) fn fill_frame_slots(
        &self,
        dst: &mut [Profile],
        frame_sequence: u32,
    ) -> (usize, usize) {
        let mut pairs = self.model.pairs();
        if self.cable_orientation() == CableOrientation::Downstream {
            pairs.reverse();
        }

        let queue = &self.shared.queue;
        let mut written = 0;
        let mut present = 0;

        for (camera, laser) in pairs {
            if written >= dst.len() {
                break;
            }

            loop {
                match queue.ready_peek_sequence(camera, laser) {
                    None => {
                        Self::invalid_profile_slot(
                            &mut dst[written],
                            self.id(),
                            camera,
                            laser,
                            frame_sequence,
                        );
                        written += 1;
                        break;
                    }
                    Some(seq) if seq > frame_sequence => {
                        Self::invalid_profile_slot(
                            &mut dst[written],
                            self.id(),
                            camera,
                            laser,
                            frame_sequence,
                        );
                        written += 1;
                        break;
                    }
                    Some(seq) if seq < frame_sequence => {
                        if let Some(raw) = queue.dequeue_ready_pair(camera, laser) {
                            queue.enqueue_free_pair(camera, laser, raw);
                        }
                    }
                    Some(_) => {
                        match queue.dequeue_ready_pair(camera, laser) {
                            Some(raw) => {
                                raw_to_profile(&raw, &mut dst[written]);
                                queue.enqueue_free_pair(camera, laser, raw);
                                written += 1;
                                present += 1;
                            }
                            None => {
                                Self::invalid_profile_slot(
                                    &mut dst[written],
                                    self.id(),
                                    camera,
                                    laser,
                                    frame_sequence,
                                );
                                written += 1;
                            }
                        }
                        break;
                    }
                }
            }
        }

        (written, present)
    }

    fn invalid_slot(
        dst: &mut RawProfile,
        scan_head_id: u32,
        camera: Camera,
        laser: Laser,
        sequence: u32,
    ) {
        dst.init();
        dst.scan_head_id = scan_head_id;
        dst.camera = camera;
        dst.laser = laser;
        dst.sequence_number = sequence;
    }

    fn invalid_profile_slot(
        dst: &mut Profile,
        scan_head_id: u32,
        camera: Camera,
        laser: Laser,
        sequence: u32,
    ) {
        dst.init();
        dst.scan_head_id = scan_head_id;
        dst.camera = camera;
        dst.laser = laser;
        dst.sequence_number = sequence;
    }

    #[cfg(test)]
    pub(crate) fn set_cached_min_scan_period(&self, period_us: u32) {
        if let Ok(mut ctrl) = self.ctrl.lock() {
            ctrl.status.min_scan_period_us = period_us;
        }
    }

    #[cfg(test)]
    pub(crate) fn process_packet_for_test(&self, packet: &DataPacket, raw: &mut RawProfile) {
        process_profile(&self.shared, packet, raw);
    }
}

impl Drop for ScanHead {
    fn drop(&mut self) {
        if self.is_scanning() {
            let _ = self.stop_scanning();
        }
        if self.is_connected() {
            let _ = self.disconnect();
        } else {
            // The receive thread may still be parked on its socket.
            self.shared.is_receive_active.store(false, Ordering::Release);
            if let Ok(mut guard) = self.receive_thread.lock() {
                if let Some(thread) = guard.take() {
                    let _ = thread.join();
                }
            }
        }
    }
}

/// Fill a pool record from a parsed datagram: metadata, encoders, then
/// every point pushed through the pair's camera-to-mill transform. Slots
/// whose wire value is the invalid sentinel keep their invalid markers.
fn process_profile(shared: &SessionShared, packet: &DataPacket, raw: &mut RawProfile) {
    let camera = shared.model.camera_port_to_id(packet.header.camera_port as u32);
    let laser = shared.model.laser_port_to_id(packet.header.laser_port as u32);

    raw.scan_head_id = packet.header.scan_head_id as u32;
    raw.camera = camera;
    raw.laser = laser;
    raw.timestamp_ns = packet.header.timestamp_ns;
    raw.flags = packet.header.flags;
    raw.sequence_number = packet.header.sequence_number;
    raw.laser_on_time_us = packet.header.laser_on_time_us as u32;
    raw.format = shared
        .format
        .read()
        .map(|f| *f)
        .unwrap_or(DataFormat::Invalid);
    raw.data_len = RAW_PROFILE_DATA_LEN as u32;
    raw.data_valid_xy = 0;
    raw.data_valid_brightness = 0;
    raw.packets_expected = 1;
    raw.packets_received = 1;

    raw.num_encoder_values = 0;
    raw.encoder_values = [INVALID_ENCODER_VALUE; ENCODER_MAX];
    for (n, &value) in packet.encoders.iter().take(ENCODER_MAX).enumerate() {
        raw.encoder_values[n] = value;
        raw.num_encoder_values += 1;
    }

    for slot in raw.data.iter_mut() {
        *slot = ProfilePoint::INVALID;
    }

    let transform = match shared.transforms.read() {
        Ok(transforms) => match transforms.get(&(camera, laser)) {
            Some(t) => *t,
            None => return,
        },
        Err(_) => return,
    };

    let stride = packet.data_stride as usize;
    for n in 0..packet.data_count as usize {
        let (x_raw, y_raw) = match packet.point_xy(n) {
            Some(p) => p,
            None => break,
        };

        if x_raw == INVALID_XY_WIRE || y_raw == INVALID_XY_WIRE {
            continue;
        }

        let idx = n * stride;
        if idx >= RAW_PROFILE_DATA_LEN {
            break;
        }

        let (x, y) = transform.camera_to_mill(x_raw as i32, y_raw as i32);
        raw.data[idx].x = x;
        raw.data[idx].y = y;
        raw.data_valid_xy += 1;

        if let Some(brightness) = packet.brightness {
            if let Some(&b) = brightness.get(n) {
                raw.data[idx].brightness = b as u16;
                raw.data_valid_brightness += 1;
            }
        }
    }
}

/// Profile receive loop: owns the data-channel socket and drains datagrams
/// into the pool until cancelled or the connection drops.
fn receive_main(
    shared: Arc<SessionShared>,
    client_name: String,
    client_ip: Ipv4Addr,
    ip: Ipv4Addr,
    serial: u32,
) {
    let mut sock = match TcpFramedSocket::connect(
        Some((client_name.as_str(), client_ip)),
        ip,
        SCAN_SERVER_DATA_PORT,
        Duration::from_secs(5),
    ) {
        Ok(sock) => sock,
        Err(e) => {
            log::warn!("head {}: data channel connect failed: {}", serial, e);
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut last_encoder: i64 = 0;
    let mut last_timestamp: u64 = 0;

    log::info!("head {}: profile receive started", serial);

    while shared.is_receive_active.load(Ordering::Relaxed) {
        let n = match sock.read(&mut buf, Some(&shared.is_receive_active)) {
            // Quiet socket or cancellation; the loop condition decides.
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                log::warn!("head {}: data channel read failed: {}", serial, e);
                break;
            }
        };

        let packet = match DataPacket::parse(&buf[..n]) {
            Some(p) => p,
            None => continue,
        };

        let camera = shared.model.camera_port_to_id(packet.header.camera_port as u32);
        let laser = shared.model.laser_port_to_id(packet.header.laser_port as u32);
        if camera == Camera::Invalid || laser == Laser::Invalid {
            continue;
        }

        if shared.is_frame_scanning.load(Ordering::Acquire) {
            // No free record means the consumer fell behind; drop the
            // profile in software.
            let mut raw = match shared.queue.dequeue_free_pair(camera, laser) {
                Some(raw) => raw,
                None => continue,
            };

            process_profile(&shared, &packet, &mut raw);
            let sequence = raw.sequence_number;

            if let Err(raw) = shared.queue.enqueue_ready_pair(camera, laser, raw) {
                shared.queue.enqueue_free_pair(camera, laser, raw);
            }
            shared.last_sequence.fetch_max(sequence, Ordering::AcqRel);
        } else {
            let travel = shared.min_encoder_travel.load(Ordering::Relaxed);
            if travel > 0 && !packet.encoders.is_empty() {
                let moved = packet.encoders[0].wrapping_sub(last_encoder).unsigned_abs();
                let elapsed = packet.header.timestamp_ns.wrapping_sub(last_timestamp);
                if moved < travel as u64 {
                    let idle_ns = shared.idle_scan_period_ns.load(Ordering::Relaxed);
                    if idle_ns == 0 || elapsed < idle_ns {
                        continue;
                    }
                }

                last_encoder = packet.encoders[0];
                last_timestamp = packet.header.timestamp_ns;
            }

            let mut raw = match shared.queue.dequeue_free() {
                Some(raw) => raw,
                None => continue,
            };

            process_profile(&shared, &packet, &mut raw);
            let sequence = raw.sequence_number;

            if let Err(raw) = shared.queue.enqueue_ready(raw) {
                shared.queue.enqueue_free(raw);
            }
            shared.last_sequence.fetch_max(sequence, Ordering::AcqRel);

            shared.new_data_cv.notify_all();
        }
    }

    // Final wake for anyone parked in a profile wait.
    shared.new_data_cv.notify_all();
    log::info!("head {}: profile receive stopped", serial);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::ScanHeadState;

    pub fn offline_discovered(head_type: ScanHeadType, serial_number: u32) -> Discovered {
        Discovered {
            serial_number,
            head_type,
            firmware_version: FirmwareVersion::new(16, 3, 1),
            ip_addr: Ipv4Addr::new(192, 168, 1, 50),
            client_name: "lo".into(),
            client_ip_addr: Ipv4Addr::new(127, 0, 0, 1),
            client_netmask: Ipv4Addr::new(255, 0, 0, 0),
            type_str: format!("{:?}", head_type),
            link_speed_mbps: 1000,
            state: ScanHeadState::Standby,
        }
    }

    /// A session that never touches the network; enough for queue, phase,
    /// and frame logic tests.
    pub fn offline_head(head_type: ScanHeadType, serial_number: u32, id: u32) -> ScanHead {
        ScanHead::new(&offline_discovered(head_type, serial_number), id, Units::Inches).unwrap()
    }

    /// Enqueue a ready profile for a pair as the receive thread would.
    pub fn feed_profile(head: &ScanHead, camera: Camera, laser: Laser, sequence: u32) {
        let queue = head.queue();
        let mut raw = queue
            .dequeue_free_pair(camera, laser)
            .expect("free ring exhausted in test");
        raw.scan_head_id = head.id();
        raw.camera = camera;
        raw.laser = laser;
        raw.sequence_number = sequence;
        raw.format = DataFormat::XyBrightnessFull;
        raw.data_len = 4;
        for i in 0..4 {
            raw.data[i] = ProfilePoint {
                x: i as i32,
                y: sequence as i32,
                brightness: 50,
            };
        }
        queue
            .enqueue_ready_pair(camera, laser, raw)
            .expect("ready ring full in test");
        head.shared
            .last_sequence
            .fetch_max(sequence, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{feed_profile, offline_head};
    use super::*;
    use crate::packet::test_support::DatagramBuilder;

    #[test]
    fn process_profile_applies_transform_and_sentinels() {
        let head = offline_head(ScanHeadType::Js50Wsc, 1111, 0);

        let mut builder = DatagramBuilder::new(vec![
            (100, 200, 40),
            (INVALID_XY_WIRE, 0, 0),
            (-50, 75, 90),
        ]);
        builder.sequence_number = 12;
        builder.encoders = vec![4242];
        let bytes = builder.build();
        let packet = DataPacket::parse(&bytes).unwrap();

        let mut raw = RawProfile::new();
        head.process_packet_for_test(&packet, &mut raw);

        assert_eq!(raw.sequence_number, 12);
        assert_eq!(raw.camera, Camera::A);
        assert_eq!(raw.laser, Laser::L1);
        assert_eq!(raw.num_encoder_values, 1);
        assert_eq!(raw.encoder_values[0], 4242);
        assert_eq!(raw.data_valid_xy, 2);
        assert_eq!(raw.data_valid_brightness, 2);

        // Default alignment is upstream: 180 degree yaw mirrors X.
        assert_eq!(raw.data[0].x, -100);
        assert_eq!(raw.data[0].y, 200);
        assert_eq!(raw.data[0].brightness, 40);
        assert!(!raw.data[1].is_valid());
        assert_eq!(raw.data[2].x, 50);
        assert_eq!(raw.data[2].y, 75);
    }

    #[test]
    fn process_profile_honors_stride_indexing() {
        let head = offline_head(ScanHeadType::Js50Wsc, 1111, 0);

        let mut builder = DatagramBuilder::new(vec![(1, 1, 10), (2, 2, 20)]);
        builder.stride = 2;
        builder.start_column = 0;
        builder.end_column = 3;
        let bytes = builder.build();
        let packet = DataPacket::parse(&bytes).unwrap();

        let mut raw = RawProfile::new();
        head.process_packet_for_test(&packet, &mut raw);

        // Points land on the stride grid: indices 0 and 2.
        assert!(raw.data[0].is_valid());
        assert!(!raw.data[1].is_valid());
        assert!(raw.data[2].is_valid());
    }

    #[test]
    fn frame_fill_with_loss_marks_missing_slots() {
        // Three single-pair heads; head B misses sequence 2.
        let heads = [
            offline_head(ScanHeadType::Js50Wsc, 1, 0),
            offline_head(ScanHeadType::Js50Wsc, 2, 1),
            offline_head(ScanHeadType::Js50Wsc, 3, 2),
        ];
        for head in &heads {
            head.queue().reset(QueueMode::Multi);
        }

        for seq in [1u32, 2, 3] {
            feed_profile(&heads[0], Camera::A, Laser::L1, seq);
            feed_profile(&heads[2], Camera::A, Laser::L1, seq);
        }
        for seq in [1u32, 3] {
            feed_profile(&heads[1], Camera::A, Laser::L1, seq);
        }

        let mut frame = vec![RawProfile::new(); 3];
        for (expect_present, frame_seq) in [(3, 1u32), (2, 2), (3, 3)] {
            let mut present = 0;
            let mut offset = 0;
            for head in &heads {
                let (written, found) = head.fill_frame_slots_raw(&mut frame[offset..], frame_seq);
                offset += written;
                present += found;
            }
            assert_eq!(offset, 3, "frame {} wrote wrong slot count", frame_seq);
            assert_eq!(present, expect_present, "frame {}", frame_seq);

            if frame_seq == 2 {
                assert_eq!(frame[1].format, DataFormat::Invalid);
                assert_eq!(frame[1].data_len, 0);
                assert_eq!(frame[1].sequence_number, 2);
                assert_eq!(frame[1].scan_head_id, 1);
            }
        }
    }

    #[test]
    fn frame_fill_recycles_late_profiles() {
        let head = offline_head(ScanHeadType::Js50Wsc, 9, 0);
        head.queue().reset(QueueMode::Multi);

        // Arrival order 1, 3, 2.
        feed_profile(&head, Camera::A, Laser::L1, 1);
        feed_profile(&head, Camera::A, Laser::L1, 3);
        feed_profile(&head, Camera::A, Laser::L1, 2);

        let mut slot = [RawProfile::new()];

        // Frame 1: emits sequence 1.
        let (_, present) = head.fill_frame_slots_raw(&mut slot, 1);
        assert_eq!(present, 1);
        assert_eq!(slot[0].sequence_number, 1);

        // Frame 2: head of queue is 3 (future); slot invalid.
        let (_, present) = head.fill_frame_slots_raw(&mut slot, 2);
        assert_eq!(present, 0);
        assert_eq!(slot[0].format, DataFormat::Invalid);

        // Frame 3: drops the late 2, emits 3.
        let (_, present) = head.fill_frame_slots_raw(&mut slot, 3);
        assert_eq!(present, 1);
        assert_eq!(slot[0].sequence_number, 3);
    }

    #[test]
    fn downstream_cable_reverses_frame_pair_order() {
        let head = offline_head(ScanHeadType::Js50Wx, 5, 0);
        head.queue().reset(QueueMode::Multi);
        head.set_cable_orientation(CableOrientation::Downstream).unwrap();

        feed_profile(&head, Camera::A, Laser::L1, 1);
        feed_profile(&head, Camera::B, Laser::L1, 1);

        let mut frame = vec![RawProfile::new(); 2];
        let (written, present) = head.fill_frame_slots_raw(&mut frame, 1);
        assert_eq!((written, present), (2, 2));
        // Model pair order is A then B; downstream reverses it.
        assert_eq!(frame[0].camera, Camera::B);
        assert_eq!(frame[1].camera, Camera::A);
    }

    #[test]
    fn configuration_rejected_while_scanning() {
        let head = offline_head(ScanHeadType::Js50Wsc, 7, 0);
        head.shared.is_scanning.store(true, Ordering::Release);
        let err = head
            .set_configuration(&ScanHeadConfiguration::default())
            .unwrap_err();
        assert_eq!(err.code(), -7);
    }

    #[test]
    fn axis_function_guards() {
        let laser_primary = offline_head(ScanHeadType::Js50X6b20, 8, 0);
        let err = laser_primary
            .set_alignment_camera(Camera::A, 0.0, 0.0, 0.0)
            .unwrap_err();
        assert_eq!(err.code(), Error::UseLaserFunction.code());

        let camera_primary = offline_head(ScanHeadType::Js50Wx, 9, 0);
        let err = camera_primary
            .set_alignment_laser(Laser::L1, 0.0, 0.0, 0.0)
            .unwrap_err();
        assert_eq!(err.code(), Error::UseCameraFunction.code());
    }

    #[test]
    fn encoder_gate_version_checks() {
        let mut discovered =
            super::test_support::offline_discovered(ScanHeadType::Js50Wsc, 77);
        discovered.firmware_version = FirmwareVersion::new(16, 2, 0);
        let head = ScanHead::new(&discovered, 0, Units::Inches).unwrap();

        let err = head.send_encoders(1, 2, 3).unwrap_err();
        assert_eq!(err.code(), -8);
        let err = head.request_scansync_serials().unwrap_err();
        assert_eq!(err.code(), -8);
    }

    #[test]
    fn scan_pair_validation() {
        let head = offline_head(ScanHeadType::Js50Wsc, 10, 0);
        let cfg = ScanHeadConfiguration::default();

        head.add_scan_pair(Camera::A, Laser::L1, cfg, 1000).unwrap();
        assert_eq!(head.scan_pairs_count(), 1);

        let err = head
            .add_scan_pair(Camera::B, Laser::L1, cfg, 1000)
            .unwrap_err();
        assert_eq!(err.code(), -3);

        head.reset_scan_pairs();
        assert_eq!(head.scan_pairs_count(), 0);
    }
}
