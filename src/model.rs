use crate::types::{Camera, Laser, ScanHeadConfiguration, ScanHeadType};

/// Which axis addresses the configuration groups of a variant: on a
/// camera-primary head the user names cameras and the laser is implied,
/// and vice versa for laser-primary heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPrimary {
    Camera,
    Laser,
}

/// Static specification of a scan head variant. Consumed as an opaque
/// typed record; one constant instance exists per product type.
#[derive(Debug)]
pub struct ScanHeadSpecification {
    pub head_type: ScanHeadType,
    pub number_of_cameras: u32,
    pub number_of_lasers: u32,
    pub max_camera_rows: u32,
    pub max_camera_columns: u32,
    pub min_scan_period_us: u32,
    pub max_scan_period_us: u32,
    pub min_laser_on_time_us: u32,
    pub max_laser_on_time_us: u32,
    /// Maximum phase table elements this head can be scheduled for.
    pub max_configuration_groups: u32,
    /// Index is the device camera port, value is the user-facing id number.
    pub camera_port_to_id: &'static [u32],
    /// Index is the device laser port, value is the user-facing id number.
    pub laser_port_to_id: &'static [u32],
    /// `(camera_port, laser_port)` pairs in specification order.
    pub configuration_groups: &'static [(u32, u32)],
    pub configuration_group_primary: PairPrimary,
    /// Camera port physically on the cable-upstream side.
    pub camera_port_cable_upstream: u32,
}

const MAX_LASER_DETECTION_THRESHOLD: u32 = 1023;
const MAX_SATURATION_THRESHOLD: u32 = 1023;
const MAX_SATURATION_PERCENTAGE: u32 = 100;

static JS50WX_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50Wx,
    number_of_cameras: 2,
    number_of_lasers: 1,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 200,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 8,
    camera_port_to_id: &[1, 2],
    laser_port_to_id: &[1],
    configuration_groups: &[(0, 0), (1, 0)],
    configuration_group_primary: PairPrimary::Camera,
    camera_port_cable_upstream: 0,
};

static JS50WSC_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50Wsc,
    number_of_cameras: 1,
    number_of_lasers: 1,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 200,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 4,
    camera_port_to_id: &[1],
    laser_port_to_id: &[1],
    configuration_groups: &[(0, 0)],
    configuration_group_primary: PairPrimary::Camera,
    camera_port_cable_upstream: 0,
};

static JS50MX_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50Mx,
    number_of_cameras: 1,
    number_of_lasers: 1,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 200,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 4,
    camera_port_to_id: &[1],
    laser_port_to_id: &[1],
    configuration_groups: &[(0, 0)],
    configuration_group_primary: PairPrimary::Camera,
    camera_port_cable_upstream: 0,
};

static JS50X6B20_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50X6b20,
    number_of_cameras: 2,
    number_of_lasers: 6,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 100,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 12,
    camera_port_to_id: &[1, 2],
    laser_port_to_id: &[1, 2, 3, 4, 5, 6],
    configuration_groups: &[(1, 0), (1, 1), (1, 2), (0, 3), (0, 4), (0, 5)],
    configuration_group_primary: PairPrimary::Laser,
    camera_port_cable_upstream: 0,
};

static JS50X6B30_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50X6b30,
    number_of_cameras: 2,
    number_of_lasers: 6,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 100,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 12,
    camera_port_to_id: &[1, 2],
    laser_port_to_id: &[1, 2, 3, 4, 5, 6],
    configuration_groups: &[(1, 0), (1, 1), (1, 2), (0, 3), (0, 4), (0, 5)],
    configuration_group_primary: PairPrimary::Laser,
    camera_port_cable_upstream: 0,
};

static JS50Z820_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50Z820,
    number_of_cameras: 2,
    number_of_lasers: 8,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 125,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 16,
    camera_port_to_id: &[1, 2],
    laser_port_to_id: &[1, 2, 3, 4, 5, 6, 7, 8],
    configuration_groups: &[
        (1, 0),
        (1, 1),
        (1, 2),
        (1, 3),
        (0, 4),
        (0, 5),
        (0, 6),
        (0, 7),
    ],
    configuration_group_primary: PairPrimary::Laser,
    camera_port_cable_upstream: 0,
};

static JS50Z830_SPEC: ScanHeadSpecification = ScanHeadSpecification {
    head_type: ScanHeadType::Js50Z830,
    number_of_cameras: 2,
    number_of_lasers: 8,
    max_camera_rows: 1156,
    max_camera_columns: 1456,
    min_scan_period_us: 125,
    max_scan_period_us: 100_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    max_configuration_groups: 16,
    camera_port_to_id: &[1, 2],
    laser_port_to_id: &[1, 2, 3, 4, 5, 6, 7, 8],
    configuration_groups: &[
        (1, 0),
        (1, 1),
        (1, 2),
        (1, 3),
        (0, 4),
        (0, 5),
        (0, 6),
        (0, 7),
    ],
    configuration_group_primary: PairPrimary::Laser,
    camera_port_cable_upstream: 0,
};

/// Look up the static specification for a product type.
pub fn specification(head_type: ScanHeadType) -> Option<&'static ScanHeadSpecification> {
    match head_type {
        ScanHeadType::Js50Wx => Some(&JS50WX_SPEC),
        ScanHeadType::Js50Wsc => Some(&JS50WSC_SPEC),
        ScanHeadType::Js50X6b20 => Some(&JS50X6B20_SPEC),
        ScanHeadType::Js50X6b30 => Some(&JS50X6B30_SPEC),
        ScanHeadType::Js50Mx => Some(&JS50MX_SPEC),
        ScanHeadType::Js50Z820 => Some(&JS50Z820_SPEC),
        ScanHeadType::Js50Z830 => Some(&JS50Z830_SPEC),
        ScanHeadType::Invalid => None,
    }
}

/// Identity plus variant specification of one scan head.
#[derive(Debug, Clone)]
pub struct ScanHeadModel {
    spec: &'static ScanHeadSpecification,
    serial_number: u32,
    id: u32,
}

impl ScanHeadModel {
    pub fn new(head_type: ScanHeadType, serial_number: u32, id: u32) -> Option<Self> {
        specification(head_type).map(|spec| Self {
            spec,
            serial_number,
            id,
        })
    }

    pub fn head_type(&self) -> ScanHeadType {
        self.spec.head_type
    }

    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn spec(&self) -> &'static ScanHeadSpecification {
        self.spec
    }

    pub fn camera_port_to_id(&self, port: u32) -> Camera {
        match self.spec.camera_port_to_id.get(port as usize) {
            Some(&id) => Camera::from_number(id),
            None => Camera::Invalid,
        }
    }

    /// The device port for a camera id; the position in the table is the
    /// port number.
    pub fn camera_id_to_port(&self, camera: Camera) -> Option<u32> {
        self.spec
            .camera_port_to_id
            .iter()
            .position(|&id| id == camera.number())
            .map(|p| p as u32)
    }

    pub fn laser_port_to_id(&self, port: u32) -> Laser {
        match self.spec.laser_port_to_id.get(port as usize) {
            Some(&id) => Laser::from_number(id),
            None => Laser::Invalid,
        }
    }

    pub fn laser_id_to_port(&self, laser: Laser) -> Option<u32> {
        self.spec
            .laser_port_to_id
            .iter()
            .position(|&id| id == laser.number())
            .map(|p| p as u32)
    }

    /// Laser implied by a camera on a camera-primary head.
    pub fn paired_laser(&self, camera: Camera) -> Laser {
        if self.is_laser_primary() || !self.is_camera_valid(camera) {
            return Laser::Invalid;
        }

        let camera_port = match self.camera_id_to_port(camera) {
            Some(p) => p,
            None => return Laser::Invalid,
        };

        let mut laser = Laser::Invalid;
        for &(c, l) in self.spec.configuration_groups {
            if c == camera_port {
                laser = self.laser_port_to_id(l);
            }
        }
        laser
    }

    /// Camera implied by a laser on a laser-primary head.
    pub fn paired_camera(&self, laser: Laser) -> Camera {
        if self.is_camera_primary() || !self.is_laser_valid(laser) {
            return Camera::Invalid;
        }

        let laser_port = match self.laser_id_to_port(laser) {
            Some(p) => p,
            None => return Camera::Invalid,
        };

        let mut camera = Camera::Invalid;
        for &(c, l) in self.spec.configuration_groups {
            if l == laser_port {
                camera = self.camera_port_to_id(c);
            }
        }
        camera
    }

    /// Camera/laser pairs in specification order.
    pub fn pairs(&self) -> Vec<(Camera, Laser)> {
        self.spec
            .configuration_groups
            .iter()
            .map(|&(c, l)| (self.camera_port_to_id(c), self.laser_port_to_id(l)))
            .collect()
    }

    pub fn pair_count(&self) -> u32 {
        self.spec.configuration_groups.len() as u32
    }

    pub fn is_camera_primary(&self) -> bool {
        self.spec.configuration_group_primary == PairPrimary::Camera
    }

    pub fn is_laser_primary(&self) -> bool {
        self.spec.configuration_group_primary == PairPrimary::Laser
    }

    pub fn is_camera_valid(&self, camera: Camera) -> bool {
        camera != Camera::Invalid && (camera.number() - 1) < self.spec.number_of_cameras
    }

    pub fn is_laser_valid(&self, laser: Laser) -> bool {
        laser != Laser::Invalid && (laser.number() - 1) < self.spec.number_of_lasers
    }

    pub fn is_pair_valid(&self, camera: Camera, laser: Laser) -> bool {
        let camera_port = match self.camera_id_to_port(camera) {
            Some(p) => p,
            None => return false,
        };
        let laser_port = match self.laser_id_to_port(laser) {
            Some(p) => p,
            None => return false,
        };

        self.spec
            .configuration_groups
            .iter()
            .any(|&(c, l)| c == camera_port && l == laser_port)
    }

    pub fn is_configuration_valid(&self, cfg: &ScanHeadConfiguration) -> bool {
        if cfg.laser_on_time_max_us > self.spec.max_laser_on_time_us
            || cfg.laser_on_time_min_us < self.spec.min_laser_on_time_us
            || cfg.laser_on_time_max_us < cfg.laser_on_time_def_us
            || cfg.laser_on_time_max_us < cfg.laser_on_time_min_us
            || cfg.laser_on_time_def_us < cfg.laser_on_time_min_us
        {
            return false;
        }

        if cfg.camera_exposure_time_max_us < cfg.camera_exposure_time_def_us
            || cfg.camera_exposure_time_max_us < cfg.camera_exposure_time_min_us
            || cfg.camera_exposure_time_def_us < cfg.camera_exposure_time_min_us
        {
            return false;
        }

        cfg.laser_detection_threshold <= MAX_LASER_DETECTION_THRESHOLD
            && cfg.saturation_threshold <= MAX_SATURATION_THRESHOLD
            && cfg.saturation_percentage <= MAX_SATURATION_PERCENTAGE
    }

    pub fn max_scan_pairs(&self) -> u32 {
        self.spec.max_configuration_groups
    }

    pub fn min_scan_period_us(&self) -> u32 {
        self.spec.min_scan_period_us
    }

    pub fn max_scan_period_us(&self) -> u32 {
        self.spec.max_scan_period_us
    }

    pub fn camera_port_cable_upstream(&self) -> u32 {
        self.spec.camera_port_cable_upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [ScanHeadType; 7] = [
        ScanHeadType::Js50Wx,
        ScanHeadType::Js50Wsc,
        ScanHeadType::Js50X6b20,
        ScanHeadType::Js50X6b30,
        ScanHeadType::Js50Mx,
        ScanHeadType::Js50Z820,
        ScanHeadType::Js50Z830,
    ];

    #[test]
    fn port_id_bijection_all_variants() {
        for t in ALL_TYPES {
            let model = ScanHeadModel::new(t, 1000, 0).unwrap();
            let spec = model.spec();

            for n in 1..=spec.number_of_cameras {
                let camera = Camera::from_number(n);
                let port = model.camera_id_to_port(camera).unwrap();
                assert_eq!(model.camera_port_to_id(port), camera, "{:?}", t);
            }
            for n in 1..=spec.number_of_lasers {
                let laser = Laser::from_number(n);
                let port = model.laser_id_to_port(laser).unwrap();
                assert_eq!(model.laser_port_to_id(port), laser, "{:?}", t);
            }

            assert!(model.camera_id_to_port(Camera::Invalid).is_none());
            assert!(model.laser_id_to_port(Laser::Invalid).is_none());
        }
    }

    #[test]
    fn every_pair_is_valid_and_ordered() {
        for t in ALL_TYPES {
            let model = ScanHeadModel::new(t, 1000, 0).unwrap();
            let pairs = model.pairs();
            assert_eq!(pairs.len() as u32, model.pair_count());
            for (camera, laser) in pairs {
                assert!(model.is_pair_valid(camera, laser), "{:?}", t);
            }
        }
    }

    #[test]
    fn x6b_pairing_alternates_cameras() {
        let model = ScanHeadModel::new(ScanHeadType::Js50X6b20, 1000, 0).unwrap();
        assert!(model.is_laser_primary());
        assert_eq!(model.paired_camera(Laser::L1), Camera::B);
        assert_eq!(model.paired_camera(Laser::L3), Camera::B);
        assert_eq!(model.paired_camera(Laser::L4), Camera::A);
        assert_eq!(model.paired_camera(Laser::L6), Camera::A);
        assert_eq!(model.paired_camera(Laser::L7), Camera::Invalid);
        // Laser-primary heads refuse camera-keyed pairing.
        assert_eq!(model.paired_laser(Camera::A), Laser::Invalid);
    }

    #[test]
    fn wx_pairing() {
        let model = ScanHeadModel::new(ScanHeadType::Js50Wx, 1000, 0).unwrap();
        assert!(model.is_camera_primary());
        assert_eq!(model.paired_laser(Camera::A), Laser::L1);
        assert_eq!(model.paired_laser(Camera::B), Laser::L1);
        assert_eq!(model.paired_camera(Laser::L1), Camera::Invalid);
    }

    #[test]
    fn configuration_validation() {
        let model = ScanHeadModel::new(ScanHeadType::Js50Wsc, 1000, 0).unwrap();
        let mut cfg = ScanHeadConfiguration::default();
        assert!(model.is_configuration_valid(&cfg));

        cfg.laser_on_time_def_us = cfg.laser_on_time_max_us + 1;
        assert!(!model.is_configuration_valid(&cfg));

        cfg = ScanHeadConfiguration::default();
        cfg.laser_detection_threshold = 1024;
        assert!(!model.is_configuration_valid(&cfg));

        cfg = ScanHeadConfiguration::default();
        cfg.saturation_percentage = 101;
        assert!(!model.is_configuration_valid(&cfg));

        cfg = ScanHeadConfiguration::default();
        cfg.laser_on_time_min_us = 1;
        assert!(!model.is_configuration_valid(&cfg));

        cfg = ScanHeadConfiguration::default();
        cfg.camera_exposure_time_def_us = cfg.camera_exposure_time_max_us + 1;
        assert!(!model.is_configuration_valid(&cfg));
    }
}
