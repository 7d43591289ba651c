use crate::types::CableOrientation;

/// User-supplied alignment of one camera/laser pair: roll and offset in
/// mill space plus the physical cable orientation.
#[derive(Debug, Clone, Copy)]
pub struct Alignment {
    pub cable: CableOrientation,
    pub roll: f64,
    pub shift_x: f64,
    pub shift_y: f64,
}

impl Default for Alignment {
    fn default() -> Self {
        Self {
            cable: CableOrientation::Upstream,
            roll: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
        }
    }
}

/// Precomputed affine for both transform directions. The four doubles per
/// direction are kept exactly as derived from roll, yaw, and scale; the
/// upstream orientation carries a 180 degree yaw whose cosine factors stay
/// in the products.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    shift_x_1000: f64,
    shift_y_1000: f64,
    camera_to_mill_xx: f64,
    camera_to_mill_xy: f64,
    camera_to_mill_yx: f64,
    camera_to_mill_yy: f64,
    mill_to_camera_xx: f64,
    mill_to_camera_xy: f64,
    mill_to_camera_yx: f64,
    mill_to_camera_yy: f64,
    camera_to_mill_scale: f64,
}

impl Transform {
    /// Camera pixel coordinates into mill 1/1000-unit coordinates.
    pub fn camera_to_mill(&self, x: i32, y: i32) -> (i32, i32) {
        let xd = x as f64;
        let yd = y as f64;

        let xm = (xd * self.camera_to_mill_xx) + (yd * self.camera_to_mill_xy) + self.shift_x_1000;
        let ym = (xd * self.camera_to_mill_yx) + (yd * self.camera_to_mill_yy) + self.shift_y_1000;

        (xm as i32, ym as i32)
    }

    /// Mill 1/1000-unit coordinates back into camera pixel coordinates.
    pub fn mill_to_camera(&self, x: i32, y: i32) -> (i32, i32) {
        let xd = x as f64;
        let yd = y as f64;

        let xc = ((xd - self.shift_x_1000) * self.mill_to_camera_xx)
            + ((yd - self.shift_y_1000) * self.mill_to_camera_xy);
        let yc = ((xd - self.shift_x_1000) * self.mill_to_camera_yx)
            + ((yd - self.shift_y_1000) * self.mill_to_camera_yy);

        (xc as i32, yc as i32)
    }
}

/// Alignment state plus its derived transform for one camera/laser pair.
#[derive(Debug, Clone)]
pub struct AlignmentParams {
    alignment: Alignment,
    transform: Transform,
    scale: f64,
}

impl AlignmentParams {
    pub fn new(
        camera_to_mill_scale: f64,
        roll: f64,
        shift_x: f64,
        shift_y: f64,
        cable: CableOrientation,
    ) -> Self {
        let mut params = Self {
            alignment: Alignment {
                cable,
                roll,
                shift_x,
                shift_y,
            },
            transform: Transform {
                shift_x_1000: 0.0,
                shift_y_1000: 0.0,
                camera_to_mill_xx: 0.0,
                camera_to_mill_xy: 0.0,
                camera_to_mill_yx: 0.0,
                camera_to_mill_yy: 0.0,
                mill_to_camera_xx: 0.0,
                mill_to_camera_xy: 0.0,
                mill_to_camera_yx: 0.0,
                mill_to_camera_yy: 0.0,
                camera_to_mill_scale,
            },
            scale: camera_to_mill_scale,
        };
        params.recalculate();
        params
    }

    pub fn set_roll_and_offset(&mut self, roll: f64, shift_x: f64, shift_y: f64) {
        self.alignment.roll = roll;
        self.alignment.shift_x = shift_x;
        self.alignment.shift_y = shift_y;
        self.recalculate();
    }

    pub fn set_cable_orientation(&mut self, cable: CableOrientation) {
        self.alignment.cable = cable;
        self.recalculate();
    }

    pub fn alignment(&self) -> &Alignment {
        &self.alignment
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// True for roll/offset identity; such alignments are not stored on the
    /// device.
    pub fn is_identity(&self) -> bool {
        self.alignment.roll == 0.0 && self.alignment.shift_x == 0.0 && self.alignment.shift_y == 0.0
    }

    fn recalculate(&mut self) {
        let rho = std::f64::consts::PI / 180.0;
        let yaw = match self.alignment.cable {
            CableOrientation::Downstream => 0.0,
            CableOrientation::Upstream => 180.0,
        };
        let sin_roll = (self.alignment.roll * rho).sin();
        let cos_roll = (self.alignment.roll * rho).cos();
        let cos_yaw = (yaw * rho).cos();
        let sin_neg_roll = (-self.alignment.roll * rho).sin();
        let cos_neg_roll = (-self.alignment.roll * rho).cos();
        let cos_neg_yaw = (-yaw * rho).cos();

        let scale = self.scale;
        let t = &mut self.transform;

        t.shift_x_1000 = self.alignment.shift_x * 1000.0;
        t.shift_y_1000 = self.alignment.shift_y * 1000.0;

        t.camera_to_mill_xx = cos_yaw * cos_roll * scale;
        t.camera_to_mill_xy = -sin_roll * scale;
        t.camera_to_mill_yx = cos_yaw * sin_roll * scale;
        t.camera_to_mill_yy = cos_roll * scale;
        t.mill_to_camera_xx = cos_neg_yaw * cos_neg_roll / scale;
        t.mill_to_camera_xy = cos_neg_yaw * -sin_neg_roll / scale;
        t.mill_to_camera_yx = sin_neg_roll / scale;
        t.mill_to_camera_yy = cos_neg_roll / scale;
    }
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0, CableOrientation::Upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trip_is_exact() {
        // scale = 1, roll = 0, shift = 0, downstream cable (yaw 0).
        let params = AlignmentParams::new(1.0, 0.0, 0.0, 0.0, CableOrientation::Downstream);
        let t = params.transform();

        for &(x, y) in &[(0, 0), (123, -456), (-1456, 1156), (32767, -32768)] {
            let (mx, my) = t.camera_to_mill(x, y);
            assert_eq!((mx, my), (x, y));
            assert_eq!(t.mill_to_camera(mx, my), (x, y));
        }
    }

    #[test]
    fn upstream_cable_mirrors_x_axis() {
        let params = AlignmentParams::new(1.0, 0.0, 0.0, 0.0, CableOrientation::Upstream);
        let t = params.transform();

        let (mx, my) = t.camera_to_mill(100, 200);
        assert_eq!((mx, my), (-100, 200));
        assert_eq!(t.mill_to_camera(mx, my), (100, 200));
    }

    #[test]
    fn round_trip_within_one_count() {
        let cases = [
            (1.0, 30.0, 2.5, -1.5, CableOrientation::Downstream),
            (25.4, -12.0, 0.0, 4.0, CableOrientation::Upstream),
            (25.4, 89.0, -3.25, 7.75, CableOrientation::Downstream),
        ];

        for (scale, roll, sx, sy, cable) in cases {
            let params = AlignmentParams::new(scale, roll, sx, sy, cable);
            let t = params.transform();
            for &(x, y) in &[(0, 0), (1000, 500), (-250, 777), (1456, -1156)] {
                let (mx, my) = t.camera_to_mill(x, y);
                let (rx, ry) = t.mill_to_camera(mx, my);
                assert!(
                    (rx - x).abs() <= 1 && (ry - y).abs() <= 1,
                    "({}, {}) -> ({}, {}) with roll {}",
                    x,
                    y,
                    rx,
                    ry,
                    roll
                );
            }
        }
    }

    #[test]
    fn identity_detection() {
        let mut params = AlignmentParams::default();
        assert!(params.is_identity());
        params.set_roll_and_offset(0.0, 1.0, 0.0);
        assert!(!params.is_identity());
    }
}
