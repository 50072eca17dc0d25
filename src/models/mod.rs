use serde::{Deserialize, Serialize};
use geo::Point;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<Point> for GeoPoint {
    fn from(point: Point) -> Self {
        Self {
            latitude: point.y(),
            longitude: point.x(),
        }
    }
}

impl From<GeoPoint> for Point {
    fn from(geo_point: GeoPoint) -> Self {
        Point::new(geo_point.longitude, geo_point.latitude)
    }
}

pub mod conflict;
pub mod controller;
pub mod decision;
pub mod events;
pub mod position;
pub mod section;
pub mod train;

pub use conflict::*;
pub use controller::*;
pub use decision::*;
pub use events::*;
pub use position::*;
pub use section::*;
pub use train::*;

/// Stable integer identity of a train.
pub type TrainId = u32;
/// Stable integer identity of a section.
pub type SectionId = u32;
/// Identity of a controller principal.
pub type ControllerId = String;
