//! Tile keys, tile math and the vector tile format.
//!
//! Vector tiles hold geometry already clipped to a tile and flattened into
//! float points plus triangle and border indices, ready for buffer filling.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use geo::BooleanOps;
use geo_types::{Coord, Geometry, LineString, MultiLineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Read, Write};
use tracing::debug;

use crate::error::Result;
use crate::geometry::{self, Envelope, SimplePoint, DEFAULT_BOUNDS, WORLD_MAX};

/// Upper bound on tiles produced for one extent.
pub const MAX_TILES_COUNT: usize = 32768;

/// Deepest zoom level tiles are built for.
pub const MAX_ZOOM: u8 = 24;

/// Growth applied to a tile extent before clipping, so strokes crossing the
/// edge are not cut visibly.
pub const TILE_RESIZE: f64 = 1.1;

/// Tile address. `cross_extent` is -1 or 1 when the tile is a wrapped copy
/// left or right of the world.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub z: u8,
    pub cross_extent: i8,
}

impl Tile {
    pub const fn new(x: i32, y: i32, z: u8) -> Self {
        Self {
            x,
            y,
            z,
            cross_extent: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileItem {
    pub tile: Tile,
    pub env: Envelope,
}

/// Edge length of a tile at `zoom` in world units.
pub fn tile_size(zoom: u8) -> f64 {
    if zoom == 0 {
        return DEFAULT_BOUNDS.width();
    }
    let half = 2f64.powi(zoom as i32) * 0.5;
    WORLD_MAX / half
}

/// World extent of an unwrapped tile.
pub fn tile_extent(tile: &Tile) -> Envelope {
    if tile.z == 0 {
        return DEFAULT_BOUNDS;
    }
    let size = tile_size(tile.z);
    let min_x = DEFAULT_BOUNDS.min_x + tile.x as f64 * size;
    let min_y = DEFAULT_BOUNDS.min_y + tile.y as f64 * size;
    Envelope::new(min_x, min_y, min_x + size, min_y + size)
}

/// Tiles covering `extent` at `zoom`, filled from the bottom-left corner.
///
/// With `unlimit_x` the range may extend one world left and right; those
/// tiles are reported with their wrapped `x` and a non-zero `cross_extent`.
/// Zooms past [`MAX_ZOOM`] give no tiles.
pub fn tiles_for_extent(extent: &Envelope, zoom: u8, unlimit_x: bool) -> Vec<TileItem> {
    if zoom == 0 {
        return vec![TileItem {
            tile: Tile::new(0, 0, 0),
            env: DEFAULT_BOUNDS,
        }];
    }

    let Some((tiles_in_dim, wrapped_end)) = Some(zoom)
        .filter(|z| *z <= MAX_ZOOM)
        .and_then(|z| 1i32.checked_shl(u32::from(z)))
        .and_then(|dim| dim.checked_mul(2).map(|end| (dim, end)))
    else {
        debug!(zoom, "zoom level out of range");
        return Vec::new();
    };
    let half = tiles_in_dim as f64 * 0.5;
    let size = tile_size(zoom);

    let mut beg_x = (extent.min_x / size + half).floor() as i32;
    let mut beg_y = (extent.min_y / size + half).floor() as i32;
    let mut end_x = (extent.max_x / size + half).ceil() as i32;
    let mut end_y = (extent.max_y / size + half).ceil() as i32;
    if beg_y == end_y {
        end_y += 1;
    }
    if beg_x == end_x {
        end_x += 1;
    }
    beg_y = beg_y.max(0);
    end_y = end_y.min(tiles_in_dim);
    if unlimit_x {
        beg_x = beg_x.max(-tiles_in_dim);
        end_x = end_x.min(wrapped_end);
    } else {
        beg_x = beg_x.max(0);
        end_x = end_x.min(tiles_in_dim);
    }

    let reserve = ((end_x - beg_x).max(0) as usize) * ((end_y - beg_y).max(0) as usize);
    let mut result = Vec::with_capacity(reserve.min(MAX_TILES_COUNT));
    for x in beg_x..end_x {
        for y in beg_y..end_y {
            let (real_x, cross_extent) = if x < 0 {
                (x + tiles_in_dim, -1)
            } else if x >= tiles_in_dim {
                (x - tiles_in_dim, 1)
            } else {
                (x, 0)
            };
            if y < 0 || y >= tiles_in_dim {
                continue;
            }

            let tile = Tile {
                x: real_x,
                y,
                z: zoom,
                cross_extent,
            };
            result.push(TileItem {
                tile,
                env: tile_extent(&tile),
            });
            if result.len() >= MAX_TILES_COUNT {
                return result;
            }
        }
    }
    result
}

/// One clipped geometry part shared by one or more features.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorTileItem {
    pub ids: BTreeSet<i64>,
    pub points: Vec<SimplePoint>,
    /// Triangles for polygons.
    pub indices: Vec<u16>,
    /// One closed index path per polygon ring.
    pub border_indices: Vec<Vec<u16>>,
    pub closed: bool,
}

impl VectorTileItem {
    pub fn with_id(fid: i64) -> Self {
        Self {
            ids: BTreeSet::from([fid]),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    /// With `check_all` every id of this item must be in `set`, otherwise one
    /// is enough.
    pub fn is_ids_present(&self, set: &BTreeSet<i64>, check_all: bool) -> bool {
        if check_all {
            !self.ids.is_empty() && self.ids.is_subset(set)
        } else {
            self.ids.iter().any(|id| set.contains(id))
        }
    }

    fn same_geometry(&self, other: &VectorTileItem) -> bool {
        self.closed == other.closed && self.points == other.points
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorTile {
    items: Vec<VectorTileItem>,
}

impl VectorTile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append items. With `check_duplicates` an item equal to an existing one
    /// only contributes its ids.
    pub fn add(&mut self, items: Vec<VectorTileItem>, check_duplicates: bool) {
        for item in items {
            if !item.is_valid() {
                continue;
            }
            if check_duplicates {
                if let Some(existing) = self.items.iter_mut().find(|i| i.same_geometry(&item)) {
                    existing.ids.extend(item.ids);
                    continue;
                }
            }
            self.items.push(item);
        }
    }

    /// Drop `fid` from every item; items left without ids are removed.
    pub fn remove(&mut self, fid: i64) {
        for item in &mut self.items {
            item.ids.remove(&fid);
        }
        self.items.retain(|item| !item.ids.is_empty());
    }

    pub fn items(&self) -> &[VectorTileItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(VectorTileItem::is_valid)
    }

    /// Zlib-compressed JSON blob, as stored in the overviews table.
    pub fn save(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    pub fn load(data: &[u8]) -> Result<Self> {
        let mut json = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

fn to_simple(coord: &Coord<f64>) -> SimplePoint {
    SimplePoint::new(coord.x as f32, coord.y as f32)
}

/// Clip `geometry` to `extent` and flatten it into tile items tagged `fid`.
///
/// Invalid geometry yields nothing.
pub fn tile_geometry(fid: i64, geom: &Geometry<f64>, extent: &Envelope) -> Vec<VectorTileItem> {
    let mut out = Vec::new();
    if !geometry::is_valid(geom) {
        return out;
    }
    let clip = extent.to_polygon();

    match geom {
        Geometry::Point(point) => tile_points(fid, std::slice::from_ref(point), extent, &mut out),
        Geometry::MultiPoint(points) => tile_points(fid, &points.0, extent, &mut out),
        Geometry::LineString(line) => tile_lines(fid, vec![line.clone()], &clip, &mut out),
        Geometry::MultiLineString(lines) => tile_lines(fid, lines.0.clone(), &clip, &mut out),
        Geometry::Polygon(polygon) => tile_polygon(fid, polygon, &clip, &mut out),
        Geometry::MultiPolygon(polygons) => {
            for polygon in &polygons.0 {
                tile_polygon(fid, polygon, &clip, &mut out);
            }
        }
        Geometry::GeometryCollection(collection) => {
            for part in &collection.0 {
                out.extend(tile_geometry(fid, part, extent));
            }
        }
        _ => debug!(fid, "unsupported geometry skipped while tiling"),
    }
    out
}

fn tile_points(fid: i64, points: &[Point<f64>], extent: &Envelope, out: &mut Vec<VectorTileItem>) {
    let mut item = VectorTileItem::with_id(fid);
    item.points = points
        .iter()
        .filter(|p| {
            p.x() >= extent.min_x
                && p.x() <= extent.max_x
                && p.y() >= extent.min_y
                && p.y() <= extent.max_y
        })
        .map(|p| to_simple(&p.0))
        .collect();
    if item.is_valid() {
        out.push(item);
    }
}

fn tile_lines(fid: i64, lines: Vec<LineString<f64>>, clip: &Polygon<f64>, out: &mut Vec<VectorTileItem>) {
    let clipped = clip.clip(&MultiLineString::new(lines), false);
    for line in clipped.0 {
        if line.0.len() < 2 {
            continue;
        }
        let mut item = VectorTileItem::with_id(fid);
        item.points = line.0.iter().map(to_simple).collect();
        out.push(item);
    }
}

fn tile_polygon(fid: i64, polygon: &Polygon<f64>, clip: &Polygon<f64>, out: &mut Vec<VectorTileItem>) {
    for part in polygon.intersection(clip).0 {
        if let Some(item) = polygon_item(fid, &part) {
            out.push(item);
        }
    }
}

fn open_ring(ring: &LineString<f64>) -> &[Coord<f64>] {
    let coords = ring.0.as_slice();
    match coords.split_last() {
        Some((last, rest)) if Some(last) == coords.first() => rest,
        _ => coords,
    }
}

// Rings without their closing point; holes follow the exterior.
fn polygon_item(fid: i64, polygon: &Polygon<f64>) -> Option<VectorTileItem> {
    let exterior = open_ring(polygon.exterior());
    if exterior.len() < 3 {
        return None;
    }
    let rings: Vec<&[Coord<f64>]> = std::iter::once(exterior)
        .chain(
            polygon
                .interiors()
                .iter()
                .map(open_ring)
                .filter(|ring| ring.len() >= 3),
        )
        .collect();

    let total: usize = rings.iter().map(|r| r.len()).sum();
    if total > u16::MAX as usize {
        debug!(fid, points = total, "polygon part too large for one tile item");
        return None;
    }

    let mut item = VectorTileItem::with_id(fid);
    item.closed = true;
    let mut data = Vec::with_capacity(total * 2);
    let mut hole_indices = Vec::new();
    for (i, ring) in rings.iter().enumerate() {
        let start = item.points.len();
        if i > 0 {
            hole_indices.push(start);
        }
        let mut border = Vec::with_capacity(ring.len() + 1);
        for (offset, coord) in ring.iter().enumerate() {
            data.push(coord.x);
            data.push(coord.y);
            item.points.push(to_simple(coord));
            border.push((start + offset) as u16);
        }
        border.push(start as u16);
        item.border_indices.push(border);
    }

    match earcutr::earcut(&data, &hole_indices, 2) {
        Ok(triangles) => item.indices = triangles.into_iter().map(|i| i as u16).collect(),
        Err(err) => {
            debug!(fid, error = ?err, "polygon triangulation failed");
            return None;
        }
    }
    if item.indices.is_empty() {
        return None;
    }
    Some(item)
}
