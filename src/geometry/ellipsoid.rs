use glam::DVec3;

/// WGS84 semi-major axis in metres.
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 first eccentricity squared: e² = 2f - f²
const WGS84_E2: f64 = 2.0 * WGS84_F - WGS84_F * WGS84_F;
/// WGS84 semi-minor axis: b = a(1 - f)
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

/// Geodetic position: longitude/latitude in radians, height in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cartographic {
    pub longitude: f64,
    pub latitude: f64,
    pub height: f64,
}

impl Cartographic {
    pub fn from_degrees(lon_deg: f64, lat_deg: f64, height: f64) -> Self {
        Self {
            longitude: lon_deg.to_radians(),
            latitude: lat_deg.to_radians(),
            height,
        }
    }
}

/// Convert geodetic (longitude, latitude in radians, height) to ECEF XYZ.
pub fn cartographic_to_ecef(c: Cartographic) -> DVec3 {
    let sin_lat = c.latitude.sin();
    let cos_lat = c.latitude.cos();
    let sin_lon = c.longitude.sin();
    let cos_lon = c.longitude.cos();

    // Radius of curvature in the prime vertical
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    DVec3::new(
        (n + c.height) * cos_lat * cos_lon,
        (n + c.height) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + c.height) * sin_lat,
    )
}

/// Convert ECEF XYZ to geodetic longitude/latitude/height.
///
/// Uses Bowring's closed-form approximation followed by one Newton step,
/// accurate to well under a millimetre for positions near the ellipsoid.
/// Returns `None` at the ellipsoid's center where the conversion is singular.
pub fn ecef_to_cartographic(p: DVec3) -> Option<Cartographic> {
    let xy = (p.x * p.x + p.y * p.y).sqrt();
    if xy < 1e-9 && p.z.abs() < 1e-9 {
        return None;
    }

    let longitude = p.y.atan2(p.x);

    // Bowring's parametric latitude seed
    let e2b = (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
    let theta = (p.z * WGS84_A).atan2(xy * WGS84_B);
    let sin_t = theta.sin();
    let cos_t = theta.cos();
    let mut latitude = (p.z + e2b * WGS84_B * sin_t * sin_t * sin_t)
        .atan2(xy - WGS84_E2 * WGS84_A * cos_t * cos_t * cos_t);

    // One Newton refinement pass
    for _ in 0..1 {
        let sin_lat = latitude.sin();
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        let refined = (p.z + WGS84_E2 * n * sin_lat).atan2(xy);
        latitude = refined;
    }

    let sin_lat = latitude.sin();
    let cos_lat = latitude.cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    let height = if cos_lat.abs() > 1e-9 {
        xy / cos_lat - n
    } else {
        p.z.abs() - WGS84_B
    };

    Some(Cartographic {
        longitude,
        latitude,
        height,
    })
}

/// Rectangle on the globe, bounds in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobeRectangle {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GlobeRectangle {
    /// The whole globe.
    pub const MAXIMUM: GlobeRectangle = GlobeRectangle {
        west: -std::f64::consts::PI,
        south: -std::f64::consts::FRAC_PI_2,
        east: std::f64::consts::PI,
        north: std::f64::consts::FRAC_PI_2,
    };

    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn from_degrees(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self::new(
            west.to_radians(),
            south.to_radians(),
            east.to_radians(),
            north.to_radians(),
        )
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn center(&self) -> Cartographic {
        Cartographic {
            longitude: (self.west + self.east) * 0.5,
            latitude: (self.south + self.north) * 0.5,
            height: 0.0,
        }
    }

    /// Whether the given position lies inside (or on the boundary of) the
    /// rectangle. Heights are ignored.
    pub fn contains(&self, c: Cartographic) -> bool {
        c.longitude >= self.west
            && c.longitude <= self.east
            && c.latitude >= self.south
            && c.latitude <= self.north
    }

    /// A quarter of this rectangle: `x` and `y` select the column/row,
    /// with `y == 0` at the south edge.
    pub fn quadrant(&self, x: u32, y: u32) -> GlobeRectangle {
        let half_w = self.width() * 0.5;
        let half_h = self.height() * 0.5;
        let west = self.west + half_w * f64::from(x);
        let south = self.south + half_h * f64::from(y);
        GlobeRectangle::new(west, south, west + half_w, south + half_h)
    }
}
