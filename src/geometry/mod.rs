pub mod ellipsoid;
pub mod view;
pub mod volume;

pub use ellipsoid::{Cartographic, GlobeRectangle};
pub use view::ViewState;
pub use volume::{BoundingRegion, BoundingSphere, BoundingVolume, OrientedBox, S2CellVolume};
