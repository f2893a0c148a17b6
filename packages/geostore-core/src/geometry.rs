use geo::{BoundingRect, CoordsIter};
use geo_types::{Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};

/// Half-extent of the EPSG:3857 world square.
pub const WORLD_MAX: f64 = 20037508.34;

pub const DEFAULT_BOUNDS: Envelope = Envelope {
    min_x: -WORLD_MAX,
    min_y: -WORLD_MAX,
    max_x: WORLD_MAX,
    max_y: WORLD_MAX,
};

// Width of the doubled world bounds, used for overview pixel sizes
pub const WORLD_WIDTH: f64 = 4.0 * WORLD_MAX;

/// Layer geometry type with WKB numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GeometryType {
    Unknown = 0,
    Point = 1,
    LineString = 2,
    Polygon = 3,
    MultiPoint = 4,
    MultiLineString = 5,
    MultiPolygon = 6,
    GeometryCollection = 7,
}

impl GeometryType {
    pub fn wkb_code(self) -> u32 {
        self as u32
    }

    pub fn from_wkb_code(code: u32) -> Self {
        match code {
            1 => GeometryType::Point,
            2 => GeometryType::LineString,
            3 => GeometryType::Polygon,
            4 => GeometryType::MultiPoint,
            5 => GeometryType::MultiLineString,
            6 => GeometryType::MultiPolygon,
            7 => GeometryType::GeometryCollection,
            _ => GeometryType::Unknown,
        }
    }

    /// Parse an `ACCEPT_GEOMETRY` value. `None` means any type.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "POINT" => Some(GeometryType::Point),
            "LINESTRING" => Some(GeometryType::LineString),
            "POLYGON" => Some(GeometryType::Polygon),
            "MULTIPOINT" => Some(GeometryType::MultiPoint),
            "MULTILINESTRING" => Some(GeometryType::MultiLineString),
            "MULTIPOLYGON" => Some(GeometryType::MultiPolygon),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GeometryType::Unknown => "UNKNOWN",
            GeometryType::Point => "POINT",
            GeometryType::LineString => "LINESTRING",
            GeometryType::Polygon => "POLYGON",
            GeometryType::MultiPoint => "MULTIPOINT",
            GeometryType::MultiLineString => "MULTILINESTRING",
            GeometryType::MultiPolygon => "MULTIPOLYGON",
            GeometryType::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }

    /// Short suffix used when a paste splits a layer by type.
    pub fn simple_name(self) -> &'static str {
        match self {
            GeometryType::Unknown => "unk",
            GeometryType::Point => "pt",
            GeometryType::LineString => "ln",
            GeometryType::Polygon => "plg",
            GeometryType::MultiPoint => "mpt",
            GeometryType::MultiLineString => "mln",
            GeometryType::MultiPolygon => "mplg",
            GeometryType::GeometryCollection => "gt",
        }
    }

    pub fn is_single(self) -> bool {
        matches!(
            self,
            GeometryType::Point | GeometryType::LineString | GeometryType::Polygon
        )
    }

    pub fn is_point(self) -> bool {
        matches!(self, GeometryType::Point | GeometryType::MultiPoint)
    }

    pub fn is_line(self) -> bool {
        matches!(self, GeometryType::LineString | GeometryType::MultiLineString)
    }

    pub fn is_polygon(self) -> bool {
        matches!(self, GeometryType::Polygon | GeometryType::MultiPolygon)
    }

    /// Single types promote to their multi counterpart (code + 3).
    pub fn to_multi(self) -> Self {
        if self.is_single() {
            Self::from_wkb_code(self.wkb_code() + 3)
        } else {
            self
        }
    }

    pub fn of(geometry: &Geometry<f64>) -> Self {
        match geometry {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::LineString(_) | Geometry::Line(_) => GeometryType::LineString,
            Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => {
                GeometryType::Polygon
            }
            Geometry::MultiPoint(_) => GeometryType::MultiPoint,
            Geometry::MultiLineString(_) => GeometryType::MultiLineString,
            Geometry::MultiPolygon(_) => GeometryType::MultiPolygon,
            Geometry::GeometryCollection(_) => GeometryType::GeometryCollection,
        }
    }
}

pub fn is_empty(geometry: &Geometry<f64>) -> bool {
    geometry.coords_count() == 0
}

/// Structural validity used by `SKIP_INVALID_GEOMETRY`.
pub fn is_valid(geometry: &Geometry<f64>) -> bool {
    fn line_ok(line: &LineString<f64>) -> bool {
        line.0.len() >= 2
    }
    fn polygon_ok(polygon: &Polygon<f64>) -> bool {
        polygon.exterior().0.len() >= 4 && polygon.interiors().iter().all(|r| r.0.len() >= 4)
    }
    let finite = geometry.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite());
    finite
        && match geometry {
            Geometry::LineString(l) => line_ok(l),
            Geometry::MultiLineString(ml) => ml.0.iter().all(line_ok),
            Geometry::Polygon(p) => polygon_ok(p),
            Geometry::MultiPolygon(mp) => mp.0.iter().all(polygon_ok),
            Geometry::GeometryCollection(gc) => gc.0.iter().all(is_valid),
            _ => true,
        }
}

/// Coerce a geometry into the destination layer type.
///
/// Singles wrap into their multi type, multis of one part unwrap. Anything
/// that cannot be expressed in `target` is returned unchanged.
pub fn force_to(geometry: Geometry<f64>, target: GeometryType) -> Geometry<f64> {
    match (geometry, target) {
        (Geometry::Point(p), GeometryType::MultiPoint) => MultiPoint(vec![p]).into(),
        (Geometry::LineString(l), GeometryType::MultiLineString) => {
            MultiLineString(vec![l]).into()
        }
        (Geometry::Polygon(p), GeometryType::MultiPolygon) => MultiPolygon(vec![p]).into(),
        (Geometry::MultiPoint(mut mp), GeometryType::Point) if mp.0.len() == 1 => {
            Geometry::Point(mp.0.remove(0))
        }
        (Geometry::MultiLineString(mut ml), GeometryType::LineString) if ml.0.len() == 1 => {
            Geometry::LineString(ml.0.remove(0))
        }
        (Geometry::MultiPolygon(mut mp), GeometryType::Polygon) if mp.0.len() == 1 => {
            Geometry::Polygon(mp.0.remove(0))
        }
        (geometry, _) => geometry,
    }
}

/// Axis-aligned extent. An all-zero envelope counts as not initialised.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn of(geometry: &Geometry<f64>) -> Option<Self> {
        geometry
            .bounding_rect()
            .map(|r| Self::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }

    pub fn is_init(&self) -> bool {
        self.min_x != 0.0 || self.min_y != 0.0 || self.max_x != 0.0 || self.max_y != 0.0
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.min_x + self.width() * 0.5,
            self.min_y + self.height() * 0.5,
        )
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn contains(&self, other: &Envelope) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    pub fn merge(&mut self, other: &Envelope) -> &mut Self {
        if !self.is_init() {
            *self = *other;
            return self;
        }
        if !other.is_init() {
            return self;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.max_x = self.max_x.max(other.max_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_y = self.max_y.max(other.max_y);
        self
    }

    /// Clip to `other`; disjoint envelopes reset to the empty envelope.
    pub fn intersect(&mut self, other: &Envelope) -> &mut Self {
        if self.intersects(other) {
            if self.is_init() {
                self.min_x = self.min_x.max(other.min_x);
                self.max_x = self.max_x.min(other.max_x);
                self.min_y = self.min_y.max(other.min_y);
                self.max_y = self.max_y.min(other.max_y);
            } else {
                *self = *other;
            }
        } else {
            *self = Envelope::default();
        }
        self
    }

    /// Scale around the centre.
    pub fn resize(&mut self, value: f64) -> &mut Self {
        if (value - 1.0).abs() < f64::EPSILON {
            return self;
        }
        let (x, y) = self.center();
        let w = self.width() * 0.5 * value;
        let h = self.height() * 0.5 * value;
        self.min_x = x - w;
        self.max_x = x + w;
        self.min_y = y - h;
        self.max_y = y + h;
        self
    }

    pub fn grow(&mut self, delta: f64) -> &mut Self {
        self.min_x -= delta;
        self.min_y -= delta;
        self.max_x += delta;
        self.max_y += delta;
        self
    }

    /// Order the bounds and widen degenerate axes by epsilon.
    pub fn fix(&mut self) -> &mut Self {
        if self.min_x > self.max_x {
            std::mem::swap(&mut self.min_x, &mut self.max_x);
        }
        if self.min_y > self.max_y {
            std::mem::swap(&mut self.min_y, &mut self.max_y);
        }
        if (self.max_x - self.min_x).abs() < f64::EPSILON {
            self.min_x -= f64::EPSILON;
            self.max_x += f64::EPSILON;
        }
        if (self.max_y - self.min_y).abs() < f64::EPSILON {
            self.min_y -= f64::EPSILON;
            self.max_y += f64::EPSILON;
        }
        self
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        geo_types::Rect::new(
            geo_types::coord! { x: self.min_x, y: self.min_y },
            geo_types::coord! { x: self.max_x, y: self.max_y },
        )
        .to_polygon()
    }
}

/// Tile-local point in single precision, as uploaded to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimplePoint {
    pub x: f32,
    pub y: f32,
}

impl SimplePoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Normal {
    pub x: f32,
    pub y: f32,
}

impl Normal {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn reversed(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// Unit perpendicular `(-dy, dx)` of the segment `beg -> end`.
pub fn get_normals(beg: &SimplePoint, end: &SimplePoint) -> Normal {
    let norm_x = -(end.y - beg.y);
    let norm_y = end.x - beg.x;
    let mut length = (norm_x * norm_x + norm_y * norm_y).sqrt();
    if length == 0.0 {
        length = 0.01;
    }
    Normal::new(norm_x / length, norm_y / length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{line_string, point, polygon};

    #[test]
    fn names_round_trip() {
        assert_eq!(GeometryType::from_name("multipoint"), Some(GeometryType::MultiPoint));
        assert_eq!(GeometryType::from_name("ANY"), None);
        assert_eq!(GeometryType::Point.to_multi(), GeometryType::MultiPoint);
        assert_eq!(GeometryType::MultiPolygon.to_multi(), GeometryType::MultiPolygon);
        assert_eq!(GeometryType::MultiPoint.simple_name(), "mpt");
    }

    #[test]
    fn force_wraps_and_unwraps() {
        let p: Geometry<f64> = point!(x: 1.0, y: 2.0).into();
        let multi = force_to(p, GeometryType::MultiPoint);
        assert_eq!(GeometryType::of(&multi), GeometryType::MultiPoint);
        let single = force_to(multi, GeometryType::Point);
        assert_eq!(GeometryType::of(&single), GeometryType::Point);
    }

    #[test]
    fn invalid_shapes() {
        let short: Geometry<f64> = line_string![(x: 0.0, y: 0.0)].into();
        assert!(!is_valid(&short));
        let square: Geometry<f64> =
            polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)].into();
        assert!(is_valid(&square));
    }

    #[test]
    fn normals_are_unit() {
        let n = get_normals(&SimplePoint::new(0.0, 0.0), &SimplePoint::new(2.0, 0.0));
        assert!((n.x - 0.0).abs() < 1e-6);
        assert!((n.y - 1.0).abs() < 1e-6);

        let zero = get_normals(&SimplePoint::new(1.0, 1.0), &SimplePoint::new(1.0, 1.0));
        assert_eq!(zero, Normal::new(0.0, 0.0));
    }

    #[test]
    fn envelope_ops() {
        let mut env = Envelope::default();
        assert!(!env.is_init());
        env.merge(&Envelope::new(0.0, 0.0, 2.0, 2.0));
        env.merge(&Envelope::new(-1.0, 1.0, 1.0, 3.0));
        assert_eq!(env, Envelope::new(-1.0, 0.0, 2.0, 3.0));

        let mut clip = env;
        clip.intersect(&Envelope::new(1.0, 1.0, 5.0, 5.0));
        assert_eq!(clip, Envelope::new(1.0, 1.0, 2.0, 3.0));

        let mut far = env;
        far.intersect(&Envelope::new(10.0, 10.0, 11.0, 11.0));
        assert!(!far.is_init());

        let mut sized = Envelope::new(0.0, 0.0, 10.0, 10.0);
        sized.resize(1.1);
        assert!((sized.min_x + 0.5).abs() < 1e-9);
        assert!((sized.max_y - 10.5).abs() < 1e-9);
    }
}
