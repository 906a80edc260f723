use glam::{DVec2, DVec3};

use crate::geometry::ellipsoid::{self, Cartographic};
use crate::geometry::volume::BoundingVolume;

/// Plane in Hesse normal form; points with `normal · p + distance >= 0` are
/// on the inside.
#[derive(Debug, Clone, Copy)]
struct Plane {
    normal: DVec3,
    distance: f64,
}

impl Plane {
    fn through(point: DVec3, normal: DVec3) -> Self {
        Self {
            normal,
            distance: -normal.dot(point),
        }
    }

    /// Whether any part of the volume is on the inside of this plane.
    fn might_contain(&self, volume: &BoundingVolume) -> bool {
        match volume {
            BoundingVolume::OrientedBox(b) => {
                let effective_radius = self.normal.dot(b.half_axes.col(0)).abs()
                    + self.normal.dot(b.half_axes.col(1)).abs()
                    + self.normal.dot(b.half_axes.col(2)).abs();
                self.normal.dot(b.center) + self.distance >= -effective_radius
            }
            BoundingVolume::Sphere(s) => self.normal.dot(s.center) + self.distance >= -s.radius,
            BoundingVolume::Region(_) | BoundingVolume::S2Cell(_) => {
                let sphere = volume.bounding_sphere();
                self.normal.dot(sphere.center) + self.distance >= -sphere.radius
            }
        }
    }
}

/// Camera state for one frustum: position, orientation, viewport, and the
/// derived culling planes and screen-space-error denominator.
#[derive(Debug, Clone)]
pub struct ViewState {
    position: DVec3,
    direction: DVec3,
    up: DVec3,
    viewport_size: DVec2,
    horizontal_fov: f64,
    vertical_fov: f64,
    sse_denominator: f64,
    position_cartographic: Option<Cartographic>,
    cull_planes: [Plane; 4],
}

impl ViewState {
    /// Build a view state from camera parameters. `direction` and `up` need
    /// not be normalized. Fields of view are full angles in radians.
    pub fn create(
        position: DVec3,
        direction: DVec3,
        up: DVec3,
        viewport_size: DVec2,
        horizontal_fov: f64,
        vertical_fov: f64,
    ) -> Self {
        let direction = direction.normalize_or_zero();
        let up = up.normalize_or_zero();
        let right = direction.cross(up).normalize_or_zero();

        let (sin_h, cos_h) = (horizontal_fov * 0.5).sin_cos();
        let (sin_v, cos_v) = (vertical_fov * 0.5).sin_cos();

        // Inward-facing side planes of the view pyramid.
        let cull_planes = [
            Plane::through(position, direction * sin_h + right * cos_h),
            Plane::through(position, direction * sin_h - right * cos_h),
            Plane::through(position, direction * sin_v + up * cos_v),
            Plane::through(position, direction * sin_v - up * cos_v),
        ];

        Self {
            position,
            direction,
            up,
            viewport_size,
            horizontal_fov,
            vertical_fov,
            sse_denominator: 2.0 * (vertical_fov * 0.5).tan(),
            position_cartographic: ellipsoid::ecef_to_cartographic(position),
            cull_planes,
        }
    }

    pub fn position(&self) -> DVec3 {
        self.position
    }

    pub fn direction(&self) -> DVec3 {
        self.direction
    }

    pub fn up(&self) -> DVec3 {
        self.up
    }

    pub fn viewport_size(&self) -> DVec2 {
        self.viewport_size
    }

    pub fn horizontal_fov(&self) -> f64 {
        self.horizontal_fov
    }

    pub fn vertical_fov(&self) -> f64 {
        self.vertical_fov
    }

    /// Geodetic camera position, when the camera is not at the earth's center.
    pub fn position_cartographic(&self) -> Option<Cartographic> {
        self.position_cartographic
    }

    /// Whether any part of the volume is inside the view frustum.
    pub fn is_bounding_volume_visible(&self, volume: &BoundingVolume) -> bool {
        self.cull_planes
            .iter()
            .all(|plane| plane.might_contain(volume))
    }

    /// Squared distance from the camera to the volume (0 inside).
    pub fn compute_distance_squared_to_bounding_volume(&self, volume: &BoundingVolume) -> f64 {
        volume.distance_squared_to(self.position)
    }

    /// Screen-space error, in pixels, of the given geometric error at the
    /// given distance.
    pub fn compute_screen_space_error(&self, geometric_error: f64, distance: f64) -> f64 {
        if geometric_error <= 0.0 {
            return 0.0;
        }
        let denominator = distance * self.sse_denominator;
        if denominator < 1e-12 {
            return f64::MAX;
        }
        (geometric_error * self.viewport_size.y) / denominator
    }
}

/// Whether a tile at the given distance is visible through the fog.
pub fn is_visible_in_fog(distance: f64, fog_density: f64) -> bool {
    if fog_density <= 0.0 {
        return true;
    }
    let fog_scalar = distance * fog_density;
    (-(fog_scalar * fog_scalar)).exp() > 0.0
}
