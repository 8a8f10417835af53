//! Camera abstractions for primary-ray generation.

use glam::{EulerRot, Quat, Vec3};

/// What ray generation needs from a camera: an eye point, a look-at point
/// and an up reference.
pub trait Camera {
    fn position(&self) -> Vec3;
    fn look_at(&self) -> Vec3;
    fn up(&self) -> Vec3 {
        Vec3::Y
    }
}

/// Fixed eye and target.
#[derive(Clone, Copy, Debug)]
pub struct LookAtCamera {
    pub position: Vec3,
    pub look_at: Vec3,
}

impl Camera for LookAtCamera {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn look_at(&self) -> Vec3 {
        self.look_at
    }
}

/// Yaw/pitch camera. Forward is `(0, 0, -1)` rotated by the yaw-pitch Euler
/// quaternion.
#[derive(Clone, Copy, Debug, Default)]
pub struct FreeFlightCamera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

impl FreeFlightCamera {
    pub fn forward(&self) -> Vec3 {
        Quat::from_euler(EulerRot::YXZ, self.yaw, self.pitch, 0.0) * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize_or_zero()
    }

    pub fn move_forward(&mut self, dist: f32) {
        self.position += self.forward() * dist;
    }

    pub fn strafe(&mut self, dist: f32) {
        self.position += self.right() * dist;
    }

    pub fn lift(&mut self, dist: f32) {
        let up = self.right().cross(self.forward());
        self.position += up * dist;
    }
}

impl Camera for FreeFlightCamera {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn look_at(&self) -> Vec3 {
        self.position + self.forward()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_free_flight_looks_down_negative_z() {
        let cam = FreeFlightCamera {
            position: Vec3::new(1.0, 2.0, 3.0),
            yaw: 0.0,
            pitch: 0.0,
        };
        let dir = cam.look_at() - cam.position();
        assert!((dir - Vec3::NEG_Z).length() < 1e-6);
    }

    #[test]
    fn quarter_turn_yaw_faces_negative_x() {
        let cam = FreeFlightCamera {
            position: Vec3::ZERO,
            yaw: std::f32::consts::FRAC_PI_2,
            pitch: 0.0,
        };
        assert!((cam.forward() - Vec3::NEG_X).length() < 1e-6);
    }

    #[test]
    fn positive_pitch_looks_up() {
        let cam = FreeFlightCamera {
            position: Vec3::ZERO,
            yaw: 0.0,
            pitch: std::f32::consts::FRAC_PI_4,
        };
        assert!(cam.forward().y > 0.5);
    }

    #[test]
    fn movement_follows_the_view_direction() {
        let mut cam = FreeFlightCamera {
            position: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
        };
        cam.move_forward(2.0);
        assert!((cam.position - Vec3::new(0.0, 0.0, -2.0)).length() < 1e-6);

        cam.strafe(1.0);
        assert!((cam.position.x - 1.0).abs() < 1e-6);

        cam.lift(3.0);
        assert!((cam.position.y - 3.0).abs() < 1e-6);
    }

    #[test]
    fn look_at_camera_reports_its_fields() {
        let cam = LookAtCamera {
            position: Vec3::new(0.0, 1.0, 2.0),
            look_at: Vec3::ZERO,
        };
        assert_eq!(cam.position(), Vec3::new(0.0, 1.0, 2.0));
        assert_eq!(cam.look_at(), Vec3::ZERO);
        assert_eq!(cam.up(), Vec3::Y);
    }
}
