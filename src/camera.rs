//! Orbit camera for the render pass.

use glam::{Mat4, Vec3};

/// Orbit camera looking at `target` from a point on a sphere around it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    /// Horizontal rotation angle in radians.
    pub yaw: f32,
    /// Vertical rotation angle in radians.
    pub pitch: f32,
    /// Distance from the target point.
    pub distance: f32,
    /// Point the camera orbits around.
    pub target: Vec3,
    /// Vertical field of view in degrees.
    pub fov: f32,
}

impl Camera {
    pub const MIN_DISTANCE: f32 = 0.5;
    pub const MAX_DISTANCE: f32 = 20.0;
    const PITCH_LIMIT: f32 = 1.5;

    pub fn new() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.3,
            distance: 3.0,
            target: Vec3::ZERO,
            fov: 45.0,
        }
    }

    pub fn with_distance(mut self, distance: f32) -> Self {
        self.distance = distance.clamp(Self::MIN_DISTANCE, Self::MAX_DISTANCE);
        self
    }

    pub fn with_target(mut self, target: Vec3) -> Self {
        self.target = target;
        self
    }

    /// Camera position in world space.
    pub fn position(&self) -> Vec3 {
        let x = self.distance * self.pitch.cos() * self.yaw.sin();
        let y = self.distance * self.pitch.sin();
        let z = self.distance * self.pitch.cos() * self.yaw.cos();
        self.target + Vec3::new(x, y, z)
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position(), self.target, Vec3::Y)
    }

    /// Projection times view for a viewport of the given size.
    pub fn view_proj(&self, width: u32, height: u32) -> Mat4 {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        let proj = Mat4::perspective_rh(self.fov.to_radians(), aspect, 0.1, 100.0);
        proj * self.view_matrix()
    }

    /// Rotate by a pointer drag of `(dx, dy)` pixels.
    pub fn orbit(&mut self, dx: f32, dy: f32) {
        self.yaw -= dx * 0.005;
        self.pitch = (self.pitch + dy * 0.005).clamp(-Self::PITCH_LIMIT, Self::PITCH_LIMIT);
    }

    /// Move toward the target by `amount` scroll lines.
    pub fn zoom(&mut self, amount: f32) {
        self.distance = (self.distance - amount * 0.3).clamp(Self::MIN_DISTANCE, Self::MAX_DISTANCE);
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_is_distance_from_target() {
        let camera = Camera::new().with_target(Vec3::new(1.0, 2.0, 3.0));
        let offset = camera.position() - camera.target;
        assert!((offset.length() - camera.distance).abs() < 1e-5);
    }

    #[test]
    fn test_orbit_and_zoom_are_clamped() {
        let mut camera = Camera::new();
        camera.orbit(0.0, 10_000.0);
        assert_eq!(camera.pitch, 1.5);
        camera.zoom(1_000.0);
        assert_eq!(camera.distance, Camera::MIN_DISTANCE);
        camera.zoom(-1_000.0);
        assert_eq!(camera.distance, Camera::MAX_DISTANCE);
    }

    #[test]
    fn test_target_projects_to_screen_center() {
        let camera = Camera::new();
        let clip = camera.view_proj(800, 600) * camera.target.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
    }
}
