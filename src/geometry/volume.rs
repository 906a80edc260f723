use glam::{DMat3, DMat4, DVec3};

use crate::geometry::ellipsoid::{self, Cartographic, GlobeRectangle};

/// Box with arbitrary orientation: a center plus three half-axis vectors
/// (the columns of `half_axes`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBox {
    pub center: DVec3,
    pub half_axes: DMat3,
}

impl OrientedBox {
    /// Axis-aligned box from min/max corners.
    pub fn from_aabb(min: DVec3, max: DVec3) -> Self {
        let center = (min + max) * 0.5;
        let half = (max - min) * 0.5;
        Self {
            center,
            half_axes: DMat3::from_diagonal(half),
        }
    }

    /// Squared distance from a point to the box surface (0 inside).
    pub fn distance_squared_to(&self, point: DVec3) -> f64 {
        let offset = point - self.center;
        let mut total = 0.0;
        for i in 0..3 {
            let axis = self.half_axes.col(i);
            let len = axis.length();
            if len < 1e-12 {
                continue;
            }
            let d = offset.dot(axis / len);
            let excess = (d.abs() - len).max(0.0);
            total += excess * excess;
        }
        total
    }

    /// The `index`-th of the 8 equal sub-boxes (bit 0 = x, bit 1 = y, bit 2 = z).
    pub fn octant(&self, index: u8) -> OrientedBox {
        let half = DMat3::from_cols(
            self.half_axes.col(0) * 0.5,
            self.half_axes.col(1) * 0.5,
            self.half_axes.col(2) * 0.5,
        );
        let sign = |bit: u8| if index & bit != 0 { 1.0 } else { -1.0 };
        let center = self.center
            + half.col(0) * sign(1)
            + half.col(1) * sign(2)
            + half.col(2) * sign(4);
        OrientedBox {
            center,
            half_axes: half,
        }
    }

    /// The `index`-th of the 4 equal sub-boxes in the x/y plane, keeping the
    /// full z extent (bit 0 = x, bit 1 = y).
    pub fn quadrant(&self, index: u8) -> OrientedBox {
        let half = DMat3::from_cols(
            self.half_axes.col(0) * 0.5,
            self.half_axes.col(1) * 0.5,
            self.half_axes.col(2),
        );
        let sign = |bit: u8| if index & bit != 0 { 1.0 } else { -1.0 };
        let center = self.center + half.col(0) * sign(1) + half.col(1) * sign(2);
        OrientedBox {
            center,
            half_axes: half,
        }
    }
}

/// Region on the globe with a height range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingRegion {
    pub rectangle: GlobeRectangle,
    pub minimum_height: f64,
    pub maximum_height: f64,
}

impl BoundingRegion {
    /// Sphere over the region's 8 corner points (4 corners at both heights).
    pub fn bounding_sphere(&self) -> BoundingSphere {
        let r = &self.rectangle;
        let corners = [
            (r.west, r.south),
            (r.west, r.north),
            (r.east, r.south),
            (r.east, r.north),
        ];
        let mut points = Vec::with_capacity(8);
        for (lon, lat) in corners {
            for height in [self.minimum_height, self.maximum_height] {
                points.push(ellipsoid::cartographic_to_ecef(Cartographic {
                    longitude: lon,
                    latitude: lat,
                    height,
                }));
            }
        }
        let center = points.iter().copied().sum::<DVec3>() / points.len() as f64;
        let radius = points
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0_f64, f64::max);
        BoundingSphere { center, radius }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f64,
}

impl BoundingSphere {
    pub fn distance_squared_to(&self, point: DVec3) -> f64 {
        let d = (point.distance(self.center) - self.radius).max(0.0);
        d * d
    }
}

/// S2 cell volume (3DTILES_bounding_volume_S2). The cell id is kept for
/// diagnostics; visibility tests fall back to a whole-earth sphere since
/// exact S2 cell geometry is out of scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct S2CellVolume {
    pub cell_id: u64,
    pub minimum_height: f64,
    pub maximum_height: f64,
}

impl S2CellVolume {
    /// Decode an S2 cell token: hex digits of the cell id with trailing
    /// zeros stripped.
    pub fn cell_id_from_token(token: &str) -> Option<u64> {
        if token.is_empty() || token.len() > 16 {
            return None;
        }
        let mut padded = token.to_owned();
        while padded.len() < 16 {
            padded.push('0');
        }
        u64::from_str_radix(&padded, 16).ok()
    }

    fn bounding_sphere(&self) -> BoundingSphere {
        BoundingSphere {
            center: DVec3::ZERO,
            radius: ellipsoid::WGS84_A + self.maximum_height.max(0.0),
        }
    }
}

/// Closed set of tile bounding volume shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    OrientedBox(OrientedBox),
    Region(BoundingRegion),
    Sphere(BoundingSphere),
    S2Cell(S2CellVolume),
}

impl BoundingVolume {
    pub fn center(&self) -> DVec3 {
        match self {
            BoundingVolume::OrientedBox(b) => b.center,
            BoundingVolume::Region(r) => r.bounding_sphere().center,
            BoundingVolume::Sphere(s) => s.center,
            BoundingVolume::S2Cell(_) => DVec3::ZERO,
        }
    }

    /// Conservative enclosing sphere, used where exact per-shape tests are
    /// not available.
    pub fn bounding_sphere(&self) -> BoundingSphere {
        match self {
            BoundingVolume::OrientedBox(b) => {
                let (x, y, z) = (b.half_axes.col(0), b.half_axes.col(1), b.half_axes.col(2));
                let radius = [x + y + z, x + y - z, x - y + z, x - y - z]
                    .iter()
                    .map(|corner| corner.length())
                    .fold(0.0_f64, f64::max);
                BoundingSphere {
                    center: b.center,
                    radius,
                }
            }
            BoundingVolume::Region(r) => r.bounding_sphere(),
            BoundingVolume::Sphere(s) => *s,
            BoundingVolume::S2Cell(s2) => s2.bounding_sphere(),
        }
    }

    /// Squared distance from a point to the volume (0 inside).
    pub fn distance_squared_to(&self, point: DVec3) -> f64 {
        match self {
            BoundingVolume::OrientedBox(b) => b.distance_squared_to(point),
            BoundingVolume::Sphere(s) => s.distance_squared_to(point),
            BoundingVolume::Region(r) => r.bounding_sphere().distance_squared_to(point),
            BoundingVolume::S2Cell(_) => 0.0,
        }
    }

    /// Apply a world transform. Globe-fixed volumes (regions, S2 cells) are
    /// already in global coordinates and pass through unchanged.
    pub fn transformed_by(&self, m: &DMat4) -> BoundingVolume {
        match self {
            BoundingVolume::OrientedBox(b) => {
                let rot = DMat3::from_mat4(*m);
                BoundingVolume::OrientedBox(OrientedBox {
                    center: m.transform_point3(b.center),
                    half_axes: rot * b.half_axes,
                })
            }
            BoundingVolume::Sphere(s) => {
                let scale = DVec3::new(
                    m.x_axis.truncate().length(),
                    m.y_axis.truncate().length(),
                    m.z_axis.truncate().length(),
                );
                BoundingVolume::Sphere(BoundingSphere {
                    center: m.transform_point3(s.center),
                    radius: s.radius * scale.max_element(),
                })
            }
            BoundingVolume::Region(_) | BoundingVolume::S2Cell(_) => *self,
        }
    }

    /// Globe rectangle footprint, where one can be stated exactly.
    pub fn globe_rectangle(&self) -> Option<GlobeRectangle> {
        match self {
            BoundingVolume::Region(r) => Some(r.rectangle),
            _ => None,
        }
    }
}
