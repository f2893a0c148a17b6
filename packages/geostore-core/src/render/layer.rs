use nalgebra::{Matrix3, Matrix4, Point2, Vector4};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::Settings;
use crate::error::{GeoStoreError, Result};
use crate::feature_class::FeatureClass;
use crate::geometry::{get_normals, Envelope, GeometryType, Normal, SimplePoint, DEFAULT_BOUNDS};
use crate::render::buffer::{
    BufferSet, BufferType, GlBuffer, GpuContext, Image, TileObject, MAX_INDICES, MAX_VERTICES,
};
use crate::render::style::{
    Footprint, LineParams, Style, StyleKind, StyleName, StyleRegistry, TessellationEvent,
    SEGMENT_FOOTPRINT,
};
use crate::render::style;
use crate::tile::{Tile, TileItem, TILE_RESIZE};

/// Depth step between polygons of a selectable layer.
const SELECTABLE_POLYGON_Z_STEP: f32 = 2.0;

/// Tiles narrower than this (in map units) are widened by one pixel so
/// neighbouring raster tiles overlap.
const SMALL_TILE_WIDTH: f64 = 15000.0;

/// A map tile as seen by the renderer: its key, its (grown) extent and the
/// matrices that place it on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct GlTile {
    pub item: TileItem,
    pub scene_matrix: Matrix4<f32>,
    pub inv_view_matrix: Matrix4<f32>,
    pub size_px: u32,
}

impl GlTile {
    pub fn new(tile_size: u32, item: TileItem) -> Self {
        let size_px = (f64::from(tile_size) * TILE_RESIZE).ceil() as u32;
        let mut env = item.env;
        env.resize(TILE_RESIZE);

        let scene_matrix = Matrix4::new_orthographic(
            env.min_x as f32,
            env.max_x as f32,
            env.min_y as f32,
            env.max_y as f32,
            DEFAULT_BOUNDS.min_x as f32,
            DEFAULT_BOUNDS.max_x as f32,
        );
        let inv_view_matrix =
            Matrix4::new_orthographic(0.0, size_px as f32, 0.0, size_px as f32, -1.0, 1.0);

        Self {
            item: TileItem {
                tile: item.tile,
                env,
            },
            scene_matrix,
            inv_view_matrix,
            size_px,
        }
    }

    pub fn tile(&self) -> &Tile {
        &self.item.tile
    }

    pub fn extent(&self) -> &Envelope {
        &self.item.env
    }
}

/// Filled tiles of one layer. `None` entries mark tiles known to have
/// nothing to draw.
///
/// Every access waits at most `timeout` for the lock; an expired wait reads
/// as "not ready yet" rather than an error.
pub struct TileCache {
    entries: Mutex<HashMap<Tile, Option<TileObject>>>,
    timeout: Duration,
}

impl TileCache {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stores a filled tile. Returns false when the lock wait expired.
    pub fn insert(&self, tile: Tile, object: Option<TileObject>) -> bool {
        match self.entries.try_lock_for(self.timeout) {
            Some(mut entries) => {
                entries.insert(tile, object);
                true
            }
            None => {
                debug!(z = tile.z, x = tile.x, y = tile.y, "tile cache busy, fill dropped");
                false
            }
        }
    }

    pub fn contains(&self, tile: &Tile) -> bool {
        self.entries
            .try_lock_for(self.timeout)
            .map_or(false, |entries| entries.contains_key(tile))
    }

    /// Runs `f` on the entry for `tile` under the lock. `None` when the tile
    /// is not filled or the lock wait expired.
    pub fn with_entry<R>(&self, tile: &Tile, f: impl FnOnce(&mut Option<TileObject>) -> R) -> Option<R> {
        let mut entries = self.entries.try_lock_for(self.timeout)?;
        entries.get_mut(tile).map(f)
    }

    /// Destroys and forgets one tile.
    pub fn free(&self, ctx: &mut dyn GpuContext, tile: &Tile) -> bool {
        let Some(mut entries) = self.entries.try_lock_for(self.timeout) else {
            return false;
        };
        if let Some(Some(mut object)) = entries.remove(tile) {
            object.destroy(ctx);
        }
        true
    }

    pub fn clear(&self, ctx: &mut dyn GpuContext) -> bool {
        let Some(mut entries) = self.entries.try_lock_for(self.timeout) else {
            return false;
        };
        for (_, object) in entries.drain() {
            if let Some(mut object) = object {
                object.destroy(ctx);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries
            .try_lock_for(self.timeout)
            .map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Anything that can hand out vector tiles.
pub trait VectorTileSource: Send + Sync {
    fn get_tile(&self, tile: &Tile, extent: &Envelope) -> crate::tile::VectorTile;

    fn geometry_type(&self) -> GeometryType;

    /// Dataset path and object name, for saving a map.
    fn source_path(&self) -> Option<(PathBuf, String)> {
        None
    }
}

impl VectorTileSource for FeatureClass {
    fn get_tile(&self, tile: &Tile, extent: &Envelope) -> crate::tile::VectorTile {
        FeatureClass::get_tile(self, tile, extent)
    }

    fn geometry_type(&self) -> GeometryType {
        FeatureClass::geometry_type(self)
    }

    fn source_path(&self) -> Option<(PathBuf, String)> {
        let dataset = self.dataset()?;
        Some((dataset.path().to_path_buf(), self.name().to_string()))
    }
}

#[derive(Debug, Default)]
struct EventLog(Option<Vec<TessellationEvent>>);

impl EventLog {
    fn push(&mut self, event: TessellationEvent) {
        if let Some(events) = self.0.as_mut() {
            events.push(event);
        }
    }
}

/// Writes one emission into `out`, flushing first if it would not fit.
fn emit(out: &mut BufferSet, footprint: Footprint, f: impl FnOnce(u16, &mut GlBuffer) -> u16) {
    if footprint.vertices == 0 && footprint.indices == 0 {
        return;
    }
    out.reserve(footprint.vertices, footprint.indices);
    let index = out.index;
    out.index = f(index, out.buffer());
}

fn emit_points(points: &[SimplePoint], style: &Style, z: f32, out: &mut BufferSet, log: &mut EventLog) {
    let footprint = style.point_footprint();
    for pt in points {
        emit(out, footprint, |index, buffer| style.add_point(pt, z, index, buffer));
        log.push(TessellationEvent::Point);
    }
}

fn emit_line(
    points: &[SimplePoint],
    closed: bool,
    line: &LineParams,
    z: f32,
    out: &mut BufferSet,
    log: &mut EventLog,
) {
    if points.len() < 2 {
        return;
    }
    let last = points.len() - 2;
    let mut prev = Normal::default();
    for (i, pair) in points.windows(2).enumerate() {
        let (p1, p2) = (&pair[0], &pair[1]);
        let normal = get_normals(p1, p2);

        if i == 0 && !closed {
            emit(out, line.cap_footprint(), |index, buffer| {
                line.add_line_cap(p1, &normal, z, index, buffer)
            });
            log.push(TessellationEvent::Cap);
        }
        if i == last && !closed {
            emit(out, line.cap_footprint(), |index, buffer| {
                line.add_line_cap(p2, &normal.reversed(), z, index, buffer)
            });
            log.push(TessellationEvent::Cap);
        }
        if i != 0 {
            emit(out, line.join_footprint(), |index, buffer| {
                line.add_line_join(p1, &prev, &normal, z, index, buffer)
            });
            log.push(TessellationEvent::Join);
        }
        emit(out, SEGMENT_FOOTPRINT, |index, buffer| {
            style::add_segment(p1, p2, &normal, z, index, buffer)
        });
        log.push(TessellationEvent::Segment);
        prev = normal;
    }
}

fn emit_border(
    points: &[SimplePoint],
    ring: &[u16],
    line: &LineParams,
    z: f32,
    out: &mut BufferSet,
    log: &mut EventLog,
) {
    if ring.len() < 2 {
        return;
    }
    let last = ring.len() - 2;
    let mut prev = Normal::default();
    let mut first = Normal::default();
    for (i, pair) in ring.windows(2).enumerate() {
        let (Some(p1), Some(p2)) = (
            points.get(usize::from(pair[0])),
            points.get(usize::from(pair[1])),
        ) else {
            break;
        };
        let normal = get_normals(p1, p2);
        if i == 0 {
            first = normal.reversed();
        }
        if i == last {
            emit(out, line.join_footprint(), |index, buffer| {
                line.add_line_join(p2, &first, &normal.reversed(), z, index, buffer)
            });
            log.push(TessellationEvent::Join);
        }
        if i != 0 {
            emit(out, line.join_footprint(), |index, buffer| {
                line.add_line_join(p1, &prev, &normal, z, index, buffer)
            });
            log.push(TessellationEvent::Join);
        }
        emit(out, SEGMENT_FOOTPRINT, |index, buffer| {
            style::add_segment(p1, p2, &normal, z, index, buffer)
        });
        log.push(TessellationEvent::Segment);
        prev = normal;
    }
}

/// Adds one polygon: its triangles to `fill` and, for bordered styles, its
/// rings to `border`. Polygons too large for a single buffer are skipped.
fn emit_polygon(
    item: &crate::tile::VectorTileItem,
    style: &Style,
    z: f32,
    fill: &mut BufferSet,
    border: &mut BufferSet,
    log: &mut EventLog,
) {
    let count = item.points.len();
    if count < 3 {
        return;
    }
    if count > MAX_VERTICES || item.indices.len() > MAX_INDICES {
        debug!(points = count, "polygon exceeds buffer capacity, skipped");
        return;
    }

    fill.reserve(count, item.indices.len());
    let base = fill.index;
    let buffer = fill.buffer();
    for pt in &item.points {
        buffer.add_vertex(&[pt.x, pt.y, z]);
    }
    for &index in &item.indices {
        buffer.add_index(base + index);
    }
    fill.index = base + count as u16;

    if let Some(line) = style.line() {
        for ring in &item.border_indices {
            emit_border(&item.points, ring, line, z, border, log);
        }
    }
}

/// Turns vector tiles into GPU buffers, one method per geometry family.
pub trait Tessellator {
    fn fill_points(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject;
    fn fill_lines(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject;
    fn fill_polygons(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject;
}

/// Tessellates every visible item with the layer style.
pub struct PlainTessellator<'a> {
    hide_ids: &'a BTreeSet<i64>,
    log: EventLog,
}

impl<'a> PlainTessellator<'a> {
    pub fn new(hide_ids: &'a BTreeSet<i64>) -> Self {
        Self {
            hide_ids,
            log: EventLog::default(),
        }
    }

    /// Keeps a record of every emission, in order.
    pub fn recording(hide_ids: &'a BTreeSet<i64>) -> Self {
        Self {
            hide_ids,
            log: EventLog(Some(Vec::new())),
        }
    }

    pub fn events(&self) -> &[TessellationEvent] {
        self.log.0.as_deref().unwrap_or_default()
    }

    fn is_hidden(&self, item: &crate::tile::VectorTileItem) -> bool {
        !self.hide_ids.is_empty() && item.is_ids_present(self.hide_ids, true)
    }
}

impl Tessellator for PlainTessellator<'_> {
    fn fill_points(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject {
        let mut out = BufferSet::new(BufferType::Point);
        for item in tile.items() {
            if item.points.is_empty() || self.is_hidden(item) {
                continue;
            }
            emit_points(&item.points, style, z, &mut out, &mut self.log);
        }
        TileObject::Vector {
            buffers: out.finish(),
        }
    }

    fn fill_lines(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject {
        let mut out = BufferSet::new(BufferType::Line);
        if let Some(line) = style.line() {
            for item in tile.items() {
                if self.is_hidden(item) {
                    continue;
                }
                emit_line(&item.points, item.closed, line, z, &mut out, &mut self.log);
            }
        }
        TileObject::Vector {
            buffers: out.finish(),
        }
    }

    fn fill_polygons(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject {
        let mut fill = BufferSet::new(BufferType::Fill);
        let mut border = BufferSet::new(BufferType::Line);
        for item in tile.items() {
            if self.is_hidden(item) {
                continue;
            }
            emit_polygon(item, style, z, &mut fill, &mut border, &mut self.log);
        }
        let mut buffers = fill.finish();
        if style.line().is_some() {
            buffers.extend(border.finish());
        }
        TileObject::Vector { buffers }
    }
}

/// Routes selected items to their own buffers drawn with a selection style.
pub struct SelectableTessellator<'a> {
    inner: PlainTessellator<'a>,
    selected_ids: &'a BTreeSet<i64>,
    selection_style: &'a Style,
}

impl<'a> SelectableTessellator<'a> {
    pub fn new(inner: PlainTessellator<'a>, selected_ids: &'a BTreeSet<i64>, selection_style: &'a Style) -> Self {
        Self {
            inner,
            selected_ids,
            selection_style,
        }
    }

    pub fn events(&self) -> &[TessellationEvent] {
        self.inner.events()
    }

    fn is_selected(&self, item: &crate::tile::VectorTileItem) -> bool {
        item.is_ids_present(self.selected_ids, false)
    }
}

impl Tessellator for SelectableTessellator<'_> {
    fn fill_points(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject {
        let mut draw = BufferSet::new(BufferType::Point);
        let mut select = BufferSet::new(BufferType::Point);
        for item in tile.items() {
            if item.points.is_empty() || self.inner.is_hidden(item) {
                continue;
            }
            if self.is_selected(item) {
                emit_points(&item.points, self.selection_style, z, &mut select, &mut self.inner.log);
            } else {
                emit_points(&item.points, style, z, &mut draw, &mut self.inner.log);
            }
        }
        TileObject::Selectable {
            buffers: draw.finish(),
            selection: select.finish(),
        }
    }

    fn fill_lines(&mut self, tile: &crate::tile::VectorTile, style: &Style, z: f32) -> TileObject {
        let mut draw = BufferSet::new(BufferType::Line);
        let mut select = BufferSet::new(BufferType::Line);
        for item in tile.items() {
            if self.inner.is_hidden(item) {
                continue;
            }
            let (line, out) = if self.is_selected(item) {
                (self.selection_style.line(), &mut select)
            } else {
                (style.line(), &mut draw)
            };
            if let Some(line) = line {
                emit_line(&item.points, item.closed, line, z, out, &mut self.inner.log);
            }
        }
        TileObject::Selectable {
            buffers: draw.finish(),
            selection: select.finish(),
        }
    }

    fn fill_polygons(&mut self, tile: &crate::tile::VectorTile, style: &Style, mut z: f32) -> TileObject {
        let mut draw_fill = BufferSet::new(BufferType::Fill);
        let mut draw_border = BufferSet::new(BufferType::Line);
        let mut select_fill = BufferSet::new(BufferType::Fill);
        let mut select_border = BufferSet::new(BufferType::Line);
        for item in tile.items() {
            if self.inner.is_hidden(item) {
                continue;
            }
            if self.is_selected(item) {
                emit_polygon(
                    item,
                    self.selection_style,
                    z,
                    &mut select_fill,
                    &mut select_border,
                    &mut self.inner.log,
                );
            } else {
                emit_polygon(item, style, z, &mut draw_fill, &mut draw_border, &mut self.inner.log);
            }
            z += SELECTABLE_POLYGON_Z_STEP;
        }

        let mut buffers = draw_fill.finish();
        if style.line().is_some() {
            buffers.extend(draw_border.finish());
        }
        let mut selection = select_fill.finish();
        if self.selection_style.line().is_some() {
            selection.extend(select_border.finish());
        }
        TileObject::Selectable { buffers, selection }
    }
}

/// Styles used for selected features, one per style kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionStyles {
    pub point: Style,
    pub line: Style,
    pub fill: Style,
}

impl Default for SelectionStyles {
    fn default() -> Self {
        Self {
            point: Style::primitive_point(),
            line: Style::simple_line(),
            fill: Style::simple_fill_bordered(),
        }
    }
}

impl SelectionStyles {
    pub fn for_kind(&self, kind: StyleKind) -> Option<&Style> {
        match kind {
            StyleKind::Point => Some(&self.point),
            StyleKind::Line => Some(&self.line),
            StyleKind::Fill => Some(&self.fill),
            StyleKind::Image => None,
        }
    }

    fn for_kind_mut(&mut self, kind: StyleKind) -> Option<&mut Style> {
        match kind {
            StyleKind::Point => Some(&mut self.point),
            StyleKind::Line => Some(&mut self.line),
            StyleKind::Fill => Some(&mut self.fill),
            StyleKind::Image => None,
        }
    }

    pub fn save(&self) -> Value {
        json!({
            "point_style_name": self.point.name().as_str(),
            "point_style": self.point.save(),
            "line_style_name": self.line.name().as_str(),
            "line_style": self.line.save(),
            "fill_style_name": self.fill.name().as_str(),
            "fill_style": self.fill.save(),
        })
    }

    pub fn load(value: &Value, registry: &StyleRegistry) -> Result<Self> {
        let load = |key: &str, default: StyleName| -> Result<Style> {
            let name = value
                .get(format!("{}_style_name", key))
                .and_then(Value::as_str)
                .unwrap_or(default.as_str());
            match value.get(format!("{}_style", key)) {
                Some(saved) => registry.load(name, saved),
                None => registry.create_by_name(name),
            }
        };
        Ok(Self {
            point: load("point", StyleName::PrimitivePoint)?,
            line: load("line", StyleName::SimpleLine)?,
            fill: load("fill", StyleName::SimpleFillBordered)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Vector,
    Raster,
}

/// Draws a tile's buffers with `style`, binding them first.
fn draw_buffers(
    ctx: &mut dyn GpuContext,
    tile: &GlTile,
    style: &mut Style,
    buffers: &[GlBuffer],
) {
    for buffer in buffers.iter().filter(|b| !b.is_empty()) {
        if style.prepare(ctx, &tile.scene_matrix, &tile.inv_view_matrix, buffer.buffer_type()) {
            style.draw(ctx, buffer);
        }
    }
}

/// Vector layer drawing one feature source.
pub struct FeatureLayer {
    name: String,
    visible: bool,
    source: Option<Arc<dyn VectorTileSource>>,
    style: Option<Style>,
    old_styles: Vec<Style>,
    hide_ids: BTreeSet<i64>,
    selected_ids: BTreeSet<i64>,
    selection: Option<SelectionStyles>,
    cache: TileCache,
}

impl std::fmt::Debug for FeatureLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureLayer")
            .field("name", &self.name)
            .field("visible", &self.visible)
            .field("style", &self.style.as_ref().map(Style::name))
            .field("selectable", &self.selection.is_some())
            .finish()
    }
}

impl FeatureLayer {
    pub fn new(name: &str, settings: &Settings) -> Self {
        Self {
            name: name.to_string(),
            visible: true,
            source: None,
            style: None,
            old_styles: Vec::new(),
            hide_ids: BTreeSet::new(),
            selected_ids: BTreeSet::new(),
            selection: None,
            cache: TileCache::with_timeout(settings.http_timeout()),
        }
    }

    /// A layer that draws selected features with `selection` styles.
    pub fn selectable(name: &str, settings: &Settings, selection: SelectionStyles) -> Self {
        Self {
            selection: Some(selection),
            ..Self::new(name, settings)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn is_selectable(&self) -> bool {
        self.selection.is_some()
    }

    pub fn source(&self) -> Option<&Arc<dyn VectorTileSource>> {
        self.source.as_ref()
    }

    pub fn style(&self) -> Option<&Style> {
        self.style.as_ref()
    }

    pub fn style_mut(&mut self) -> Option<&mut Style> {
        self.style.as_mut()
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn set_feature_class(&mut self, feature_class: Arc<FeatureClass>, registry: &StyleRegistry) {
        self.set_source(feature_class, registry);
    }

    /// Attaches a source and picks the default style for its geometry.
    pub fn set_source(&mut self, source: Arc<dyn VectorTileSource>, registry: &StyleRegistry) {
        let geometry_type = source.geometry_type();
        self.source = Some(source);
        let name = if geometry_type.is_point() {
            Some(StyleName::PrimitivePoint)
        } else if geometry_type.is_line() {
            Some(StyleName::SimpleLine)
        } else if geometry_type.is_polygon() {
            Some(StyleName::SimpleFillBordered)
        } else {
            None
        };
        if let Some(style) = name.and_then(|name| registry.create(name).ok()) {
            self.replace_style(style);
        }
    }

    pub fn set_style(&mut self, style: Style) {
        self.replace_style(style);
    }

    pub fn set_style_name(&mut self, name: &str, registry: &StyleRegistry) -> Result<()> {
        let style = registry.create_by_name(name)?;
        self.replace_style(style);
        Ok(())
    }

    // The old style may still own GPU objects; it is released on the next free.
    fn replace_style(&mut self, style: Style) {
        if let Some(old) = self.style.replace(style) {
            self.old_styles.push(old);
        }
    }

    pub fn hide_ids(&self) -> &BTreeSet<i64> {
        &self.hide_ids
    }

    pub fn set_hide_ids(&mut self, ids: BTreeSet<i64>) {
        self.hide_ids = ids;
    }

    pub fn selected_ids(&self) -> &BTreeSet<i64> {
        &self.selected_ids
    }

    pub fn set_selected_ids(&mut self, ids: BTreeSet<i64>) {
        self.selected_ids = ids;
    }

    pub fn selection_style(&self) -> Option<&Style> {
        let kind = self.style.as_ref()?.kind();
        self.selection.as_ref()?.for_kind(kind)
    }

    /// Tessellates `tile` into the cache. Returns true once the tile is
    /// settled, including when there is nothing to draw.
    pub fn fill(&self, tile: &GlTile, z: f32) -> bool {
        let key = *tile.tile();
        if !self.visible {
            return self.cache.insert(key, None);
        }
        if self.cache.contains(&key) {
            return true;
        }
        let (Some(source), Some(style)) = (self.source.as_ref(), self.style.as_ref()) else {
            return self.cache.insert(key, None);
        };

        let vtile = source.get_tile(&key, tile.extent());
        if vtile.is_empty() {
            return self.cache.insert(key, None);
        }

        let mut plain = PlainTessellator::new(&self.hide_ids);
        let selection_style = self.selection_style();
        let object = match selection_style {
            Some(selection_style) => {
                let mut selectable =
                    SelectableTessellator::new(plain, &self.selected_ids, selection_style);
                Self::tessellate(&mut selectable, &vtile, style, z)
            }
            None => Self::tessellate(&mut plain, &vtile, style, z),
        };
        self.cache.insert(key, object)
    }

    fn tessellate(
        tessellator: &mut dyn Tessellator,
        vtile: &crate::tile::VectorTile,
        style: &Style,
        z: f32,
    ) -> Option<TileObject> {
        match style.kind() {
            StyleKind::Point => Some(tessellator.fill_points(vtile, style, z)),
            StyleKind::Line => Some(tessellator.fill_lines(vtile, style, z)),
            StyleKind::Fill => Some(tessellator.fill_polygons(vtile, style, z)),
            StyleKind::Image => None,
        }
    }

    /// Draws a filled tile. False means the tile is not ready yet.
    pub fn draw(&mut self, ctx: &mut dyn GpuContext, tile: &GlTile) -> bool {
        let Some(style) = self.style.as_mut() else {
            return true;
        };
        self.cache
            .with_entry(tile.tile(), |entry| {
                if let Some(object) = entry {
                    object.activate(ctx);
                    draw_buffers(ctx, tile, style, object.buffers());
                }
                true
            })
            .unwrap_or(false)
    }

    /// Draws the selected features of a filled tile with the selection style.
    pub fn draw_selection(&mut self, ctx: &mut dyn GpuContext, tile: &GlTile) -> bool {
        let Some(kind) = self.style.as_ref().map(Style::kind) else {
            return true;
        };
        let Some(style) = self.selection.as_mut().and_then(|s| s.for_kind_mut(kind)) else {
            return true;
        };
        self.cache
            .with_entry(tile.tile(), |entry| {
                if let Some(object) = entry {
                    object.activate(ctx);
                    draw_buffers(ctx, tile, style, object.selection());
                }
                true
            })
            .unwrap_or(false)
    }

    pub fn free(&mut self, ctx: &mut dyn GpuContext, tile: &Tile) -> bool {
        for mut style in self.old_styles.drain(..) {
            style.destroy(ctx);
        }
        self.cache.free(ctx, tile)
    }

    /// Drops every cached tile.
    pub fn clear(&mut self, ctx: &mut dyn GpuContext) -> bool {
        for mut style in self.old_styles.drain(..) {
            style.destroy(ctx);
        }
        self.cache.clear(ctx)
    }

    pub fn save(&self) -> Value {
        let mut out = json!({
            "name": self.name,
            "type": LayerType::Vector,
            "visible": self.visible,
            "selectable": self.selection.is_some(),
        });
        if let Some((path, name)) = self.source.as_ref().and_then(|s| s.source_path()) {
            out["src"] = json!({ "path": path, "name": name });
        }
        if let Some(style) = &self.style {
            out["style_name"] = json!(style.name().as_str());
            out["style"] = style.save();
        }
        out
    }

    /// Restores name, visibility and style. The source is attached by the
    /// caller, which knows how to resolve `src`.
    pub fn load(&mut self, value: &Value, registry: &StyleRegistry) -> Result<()> {
        if !value.is_object() {
            return Err(GeoStoreError::Unsupported(format!("layer {}", self.name)));
        }
        if let Some(name) = value.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        self.visible = value.get("visible").and_then(Value::as_bool).unwrap_or(self.visible);
        if let Some(name) = value.get("style_name").and_then(Value::as_str) {
            let style = registry.load(name, value.get("style").unwrap_or(&Value::Null))?;
            self.replace_style(style);
        }
        Ok(())
    }
}

/// Pixel rectangle in raster space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Source of raster pixels.
pub trait RasterSource: Send + Sync {
    fn name(&self) -> &str;

    fn extent(&self) -> Envelope;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn band_count(&self) -> u8;

    /// Affine pixel-to-map transform, GDAL order.
    fn geo_transform(&self) -> Option<[f64; 6]>;

    /// Output size to read `window` at when the requested size is smaller
    /// than the window. `None` means no overview fits; read as requested.
    fn best_overview(&self, window: &PixelWindow, out_width: u32, out_height: u32) -> Option<(u32, u32)>;

    /// Resamples `window` into `buffer` as RGBA rows of `out_width` pixels.
    /// `bands` maps each RGBA channel to a 1-based band; 0 leaves the
    /// channel as prefilled.
    fn pixel_data(
        &self,
        buffer: &mut [u8],
        window: &PixelWindow,
        out_width: u32,
        out_height: u32,
        bands: [u8; 4],
    ) -> Result<()>;

    fn source_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Raster held in memory, one byte plane per band.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bands: Vec<Vec<u8>>,
    pub extent: Envelope,
    pub geo_transform: Option<[f64; 6]>,
    /// Available overview reduction factors, e.g. `[2, 4]`.
    pub overviews: Vec<u32>,
    pub fail_reads: bool,
}

impl MemoryRaster {
    /// A north-up raster covering `extent`.
    pub fn new(name: &str, width: u32, height: u32, bands: Vec<Vec<u8>>, extent: Envelope) -> Self {
        let geo_transform = [
            extent.min_x,
            extent.width() / f64::from(width.max(1)),
            0.0,
            extent.max_y,
            0.0,
            -extent.height() / f64::from(height.max(1)),
        ];
        Self {
            name: name.to_string(),
            width,
            height,
            bands,
            extent,
            geo_transform: Some(geo_transform),
            overviews: Vec::new(),
            fail_reads: false,
        }
    }
}

impl RasterSource for MemoryRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn extent(&self) -> Envelope {
        self.extent
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn band_count(&self) -> u8 {
        u8::try_from(self.bands.len()).unwrap_or(u8::MAX)
    }

    fn geo_transform(&self) -> Option<[f64; 6]> {
        self.geo_transform
    }

    fn best_overview(&self, window: &PixelWindow, out_width: u32, out_height: u32) -> Option<(u32, u32)> {
        self.overviews
            .iter()
            .copied()
            .filter(|factor| {
                *factor > 1 && window.width / factor >= out_width && window.height / factor >= out_height
            })
            .max()
            .map(|factor| (window.width.div_ceil(factor), window.height.div_ceil(factor)))
    }

    fn pixel_data(
        &self,
        buffer: &mut [u8],
        window: &PixelWindow,
        out_width: u32,
        out_height: u32,
        bands: [u8; 4],
    ) -> Result<()> {
        if self.fail_reads {
            return Err(GeoStoreError::Store(format!("read of {} failed", self.name)));
        }
        if out_width == 0 || out_height == 0 {
            return Ok(());
        }
        for band in bands.iter().filter(|b| **b != 0) {
            if usize::from(*band) > self.bands.len() {
                return Err(GeoStoreError::NotFound(format!("band {}", band)));
            }
        }

        for oy in 0..out_height {
            let sy = window.y + oy * window.height / out_height;
            for ox in 0..out_width {
                let sx = window.x + ox * window.width / out_width;
                let src = (sy * self.width + sx) as usize;
                let dst = ((oy * out_width + ox) * 4) as usize;
                for (channel, band) in bands.iter().enumerate() {
                    if *band == 0 {
                        continue;
                    }
                    let plane = &self.bands[usize::from(*band) - 1];
                    if let (Some(value), Some(slot)) = (plane.get(src), buffer.get_mut(dst + channel)) {
                        *slot = *value;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Maps raster extent corners into pixel space.
fn pixel_extent(raster: &dyn RasterSource, extent: &Envelope) -> Envelope {
    let inverse = raster.geo_transform().and_then(|gt| {
        Matrix3::new(gt[1], gt[2], gt[0], gt[4], gt[5], gt[3], 0.0, 0.0, 1.0).try_inverse()
    });
    let mut out = match inverse {
        Some(inv) => {
            let lower = inv.transform_point(&Point2::new(extent.min_x, extent.min_y));
            let upper = inv.transform_point(&Point2::new(extent.max_x, extent.max_y));
            Envelope::new(lower.x, upper.y, upper.x, lower.y)
        }
        None => {
            let height = f64::from(raster.height());
            Envelope::new(extent.min_x, height - extent.max_y, extent.max_x, height - extent.min_y)
        }
    };
    out.fix();
    out
}

fn raster_quad(extent: &Envelope, z: f32) -> GlBuffer {
    let mut buffer = GlBuffer::new(BufferType::Texture);
    let (min_x, min_y) = (extent.min_x as f32, extent.min_y as f32);
    let (max_x, max_y) = (extent.max_x as f32, extent.max_y as f32);
    buffer.add_vertex(&[min_x, min_y, z, 0.0, 1.0]);
    buffer.add_vertex(&[min_x, max_y, z, 0.0, 0.0]);
    buffer.add_vertex(&[max_x, max_y, z, 1.0, 0.0]);
    buffer.add_vertex(&[max_x, min_y, z, 1.0, 1.0]);
    for index in [0, 1, 2, 0, 2, 3] {
        buffer.add_index(index);
    }
    buffer
}

/// Layer drawing a raster as textured quads.
pub struct RasterLayer {
    name: String,
    visible: bool,
    source: Option<Arc<dyn RasterSource>>,
    style: Style,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    /// 0 means the raster has no alpha band.
    pub alpha: u8,
    pub transparency: u8,
    cache: TileCache,
}

impl std::fmt::Debug for RasterLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterLayer")
            .field("name", &self.name)
            .field("visible", &self.visible)
            .field("bands", &[self.red, self.green, self.blue, self.alpha])
            .field("transparency", &self.transparency)
            .finish()
    }
}

impl RasterLayer {
    pub fn new(name: &str, settings: &Settings) -> Self {
        Self {
            name: name.to_string(),
            visible: true,
            source: None,
            style: Style::simple_image(),
            red: 1,
            green: 2,
            blue: 3,
            alpha: 0,
            transparency: 0,
            cache: TileCache::with_timeout(settings.http_timeout()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn source(&self) -> Option<&Arc<dyn RasterSource>> {
        self.source.as_ref()
    }

    pub fn set_raster(&mut self, raster: Arc<dyn RasterSource>) {
        if raster.band_count() == 4 {
            self.alpha = 4;
        }
        self.style = Style::simple_image();
        self.source = Some(raster);
    }

    /// Reads the raster part under `tile` into a texture. Returns false when
    /// the read failed and should be retried; on the last try the tile is
    /// settled as empty instead.
    pub fn fill(&self, tile: &GlTile, z: f32, is_last_try: bool) -> bool {
        let key = *tile.tile();
        if !self.visible {
            return self.cache.insert(key, None);
        }
        if self.cache.contains(&key) {
            return true;
        }
        let Some(raster) = self.source.as_deref() else {
            return self.cache.insert(key, None);
        };

        let mut tile_extent = *tile.extent();
        if tile_extent.width() < SMALL_TILE_WIDTH {
            let step = tile.scene_matrix * Vector4::new(1.0, 0.0, 0.0, 0.0);
            tile_extent.resize(1.0 + f64::from(step[0]));
        }

        let mut out_extent = raster.extent();
        out_extent.intersect(&tile_extent);
        if !out_extent.is_init() {
            debug!(raster = raster.name(), "raster does not intersect tile");
            return self.cache.insert(key, None);
        }

        let size_px = f64::from(tile.size_px);
        let mut out_width = (out_extent.width() * size_px / tile_extent.width()) as u32;
        let mut out_height = (out_extent.height() * size_px / tile_extent.height()) as u32;

        let pixels = pixel_extent(raster, &out_extent);
        let x = pixels.min_x.floor().max(0.0) as u32;
        let y = pixels.min_y.floor().max(0.0) as u32;
        let window = PixelWindow {
            x,
            y,
            width: (pixels.width().ceil() as u32).min(raster.width().saturating_sub(x)),
            height: (pixels.height().ceil() as u32).min(raster.height().saturating_sub(y)),
        };

        let mut smooth = false;
        if out_width >= window.width && out_height >= window.height {
            out_width = window.width;
            out_height = window.height;
            smooth = true;
        } else if let Some((w, h)) = raster.best_overview(&window, out_width, out_height) {
            out_width = w;
            out_height = h;
        }

        let size = (out_width * out_height * 4) as usize;
        let fill_byte = if self.alpha == 0 { 255 - self.transparency } else { 0 };
        let mut data = vec![fill_byte; size];
        let bands = [self.red, self.green, self.blue, self.alpha];
        if let Err(err) = raster.pixel_data(&mut data, &window, out_width, out_height, bands) {
            debug!(raster = raster.name(), error = %err, last_try = is_last_try, "raster read failed");
            if is_last_try {
                return self.cache.insert(key, None);
            }
            return false;
        }

        let mut image = Image::new(out_width, out_height, data);
        image.smooth = smooth;
        let object = TileObject::Raster {
            buffer: raster_quad(&out_extent, z),
            image,
        };
        self.cache.insert(key, Some(object))
    }

    pub fn draw(&mut self, ctx: &mut dyn GpuContext, tile: &GlTile) -> bool {
        let style = &mut self.style;
        self.cache
            .with_entry(tile.tile(), |entry| {
                if let Some(object) = entry {
                    object.activate(ctx);
                    draw_buffers(ctx, tile, style, object.buffers());
                }
                true
            })
            .unwrap_or(false)
    }

    pub fn free(&mut self, ctx: &mut dyn GpuContext, tile: &Tile) -> bool {
        self.cache.free(ctx, tile)
    }

    pub fn clear(&mut self, ctx: &mut dyn GpuContext) -> bool {
        self.cache.clear(ctx)
    }

    pub fn save(&self) -> Value {
        let mut out = json!({
            "name": self.name,
            "type": LayerType::Raster,
            "visible": self.visible,
            "raster": {
                "red": self.red,
                "green": self.green,
                "blue": self.blue,
                "alpha": self.alpha,
                "transparency": self.transparency,
            },
        });
        if let Some(path) = self.source.as_ref().and_then(|s| s.source_path()) {
            out["src"] = json!({ "path": path });
        }
        out
    }

    pub fn load(&mut self, value: &Value) -> Result<()> {
        if !value.is_object() {
            return Err(GeoStoreError::Unsupported(format!("layer {}", self.name)));
        }
        if let Some(name) = value.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        self.visible = value.get("visible").and_then(Value::as_bool).unwrap_or(self.visible);
        if let Some(raster) = value.get("raster") {
            let band = |key: &str, current: u8| {
                raster
                    .get(key)
                    .and_then(Value::as_u64)
                    .and_then(|v| u8::try_from(v).ok())
                    .unwrap_or(current)
            };
            self.red = band("red", self.red);
            self.green = band("green", self.green);
            self.blue = band("blue", self.blue);
            self.alpha = band("alpha", self.alpha);
            self.transparency = band("transparency", self.transparency);
        }
        self.style = Style::simple_image();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::buffer::{GpuCall, Primitive, RecordingContext};
    use crate::render::style::{CapType, JoinType, StyleBody};
    use crate::tile::{tile_extent, VectorTile, VectorTileItem};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        geometry_type: GeometryType,
        tile: VectorTile,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(geometry_type: GeometryType, items: Vec<VectorTileItem>) -> Arc<Self> {
            let mut tile = VectorTile::new();
            tile.add(items, false);
            Arc::new(Self {
                geometry_type,
                tile,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl VectorTileSource for StubSource {
        fn get_tile(&self, _tile: &Tile, _extent: &Envelope) -> VectorTile {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tile.clone()
        }

        fn geometry_type(&self) -> GeometryType {
            self.geometry_type
        }
    }

    fn item(fid: i64, points: &[(f32, f32)]) -> VectorTileItem {
        let mut item = VectorTileItem::with_id(fid);
        item.points = points.iter().map(|(x, y)| SimplePoint::new(*x, *y)).collect();
        item
    }

    fn square(fid: i64) -> VectorTileItem {
        let mut item = item(fid, &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]);
        item.indices = vec![0, 1, 2, 0, 2, 3];
        item.border_indices = vec![vec![0, 1, 2, 3, 0]];
        item
    }

    fn gl_tile(x: i32, y: i32, z: u8) -> GlTile {
        let tile = Tile::new(x, y, z);
        GlTile::new(
            256,
            TileItem {
                tile,
                env: tile_extent(&tile),
            },
        )
    }

    fn settings() -> Settings {
        Settings::default().with_http_timeout_secs(0.05)
    }

    #[test]
    fn three_point_line_emission_order() {
        let mut tile = VectorTile::new();
        tile.add(vec![item(1, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)])], false);
        let mut style = Style::simple_line();
        if let StyleBody::Line(line) = style.body_mut() {
            line.cap = CapType::Square;
            line.join = JoinType::Bevel;
        }

        let hide = BTreeSet::new();
        let mut tessellator = PlainTessellator::recording(&hide);
        let object = tessellator.fill_lines(&tile, &style, 0.0);
        use TessellationEvent::*;
        assert_eq!(tessellator.events(), &[Cap, Segment, Cap, Join, Segment]);

        // 2 square caps, 2 segments and 1 bevel join.
        let buffers = object.buffers();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].vertex_count(), 4 + 4 + 4 + 4 + 3);
        assert_eq!(buffers[0].index_count(), 6 + 6 + 6 + 6 + 3);
    }

    #[test]
    fn closed_line_has_no_caps() {
        let mut tile = VectorTile::new();
        let mut ring = item(1, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]);
        ring.closed = true;
        tile.add(vec![ring], false);
        let hide = BTreeSet::new();
        let mut tessellator = PlainTessellator::recording(&hide);
        tessellator.fill_lines(&tile, &Style::simple_line(), 0.0);
        assert!(!tessellator.events().contains(&TessellationEvent::Cap));
    }

    #[test]
    fn polygon_fill_offsets_by_point_count() {
        let mut tile = VectorTile::new();
        tile.add(vec![square(1), square(2)], false);
        let hide = BTreeSet::new();
        let object = PlainTessellator::new(&hide).fill_polygons(&tile, &Style::simple_fill(), 0.0);

        let buffers = object.buffers();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].buffer_type(), BufferType::Fill);
        assert_eq!(&buffers[0].indices()[6..], &[4, 5, 6, 4, 6, 7]);
    }

    #[test]
    fn bordered_polygon_adds_line_buffers_after_fill() {
        let mut tile = VectorTile::new();
        tile.add(vec![square(1)], false);
        let hide = BTreeSet::new();
        let mut tessellator = PlainTessellator::recording(&hide);
        let object = tessellator.fill_polygons(&tile, &Style::simple_fill_bordered(), 0.0);

        let types: Vec<BufferType> = object.buffers().iter().map(GlBuffer::buffer_type).collect();
        assert_eq!(types, vec![BufferType::Fill, BufferType::Line]);
        let segments = tessellator
            .events()
            .iter()
            .filter(|e| **e == TessellationEvent::Segment)
            .count();
        assert_eq!(segments, 4);
    }

    #[test]
    fn hidden_items_are_skipped() {
        let mut tile = VectorTile::new();
        tile.add(vec![item(1, &[(0.0, 0.0)]), item(2, &[(1.0, 1.0)])], false);
        let hide = BTreeSet::from([1]);
        let object = PlainTessellator::new(&hide).fill_points(&tile, &Style::simple_point(), 0.0);
        assert_eq!(object.buffers()[0].vertices(), &[1.0, 1.0, 0.0]);
    }

    #[test]
    fn selectable_routes_selected_items() {
        let mut tile = VectorTile::new();
        tile.add(vec![square(1), square(2), square(3)], false);
        let hide = BTreeSet::from([3]);
        let selected = BTreeSet::from([2]);
        let selection_style = Style::simple_fill();
        let mut tessellator =
            SelectableTessellator::new(PlainTessellator::new(&hide), &selected, &selection_style);
        let object = tessellator.fill_polygons(&tile, &Style::simple_fill(), 1.0);

        let drawn = &object.buffers()[0];
        let chosen = &object.selection()[0];
        assert_eq!(drawn.vertex_count(), 4);
        assert_eq!(chosen.vertex_count(), 4);
        // z grows by 2 per polygon: fid 1 at 1.0, fid 2 at 3.0.
        assert_eq!(drawn.vertices()[2], 1.0);
        assert_eq!(chosen.vertices()[2], 3.0);
        assert_eq!(chosen.indices(), &[0, 1, 2, 0, 2, 3]);
    }

    #[test]
    fn cache_reports_not_ready_while_locked() {
        let cache = TileCache::with_timeout(Duration::from_millis(10));
        let key = Tile::new(0, 0, 1);
        assert!(cache.insert(key, None));
        {
            let _held = cache.entries.lock();
            assert!(!cache.contains(&key));
            assert!(cache.with_entry(&key, |_| ()).is_none());
            assert!(!cache.insert(key, None));
        }
        assert!(cache.contains(&key));
    }

    #[test]
    fn default_style_follows_geometry() {
        let registry = StyleRegistry::new();
        let settings = settings();
        for (geometry_type, expected) in [
            (GeometryType::MultiPoint, StyleName::PrimitivePoint),
            (GeometryType::LineString, StyleName::SimpleLine),
            (GeometryType::MultiPolygon, StyleName::SimpleFillBordered),
        ] {
            let mut layer = FeatureLayer::new("l", &settings);
            layer.set_source(StubSource::new(geometry_type, Vec::new()), &registry);
            assert_eq!(layer.style().map(Style::name), Some(expected));
        }
    }

    #[test]
    fn draw_distinguishes_missing_and_empty_tiles() {
        let registry = StyleRegistry::new();
        let mut ctx = RecordingContext::new();
        let mut layer = FeatureLayer::new("empty", &settings());
        layer.set_source(StubSource::new(GeometryType::Point, Vec::new()), &registry);

        let tile = gl_tile(0, 0, 1);
        assert!(!layer.draw(&mut ctx, &tile));
        assert!(layer.fill(&tile, 0.0));
        assert!(layer.cache().with_entry(tile.tile(), |e| e.is_none()).unwrap());
        assert!(layer.draw(&mut ctx, &tile));
        assert!(ctx.calls.is_empty());
    }

    #[test]
    fn fill_then_draw_uploads_and_draws() {
        let registry = StyleRegistry::new();
        let mut ctx = RecordingContext::new();
        let source = StubSource::new(GeometryType::Point, vec![item(1, &[(0.0, 0.0), (5.0, 5.0)])]);
        let mut layer = FeatureLayer::new("points", &settings());
        layer.set_source(source.clone(), &registry);

        let tile = gl_tile(0, 0, 1);
        assert!(layer.fill(&tile, 0.0));
        assert!(layer.fill(&tile, 0.0));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        assert!(layer.draw(&mut ctx, &tile));
        // Default primitive point is a 10-segment circle: 30 indices per point.
        assert_eq!(ctx.draws(), vec![(Primitive::Triangles, 1, 60)]);

        assert!(layer.draw(&mut ctx, &tile));
        assert!(ctx.calls.contains(&GpuCall::BindBuffer(1)));

        assert!(layer.free(&mut ctx, tile.tile()));
        assert_eq!(ctx.calls.last(), Some(&GpuCall::DeleteBuffer(1)));
        assert!(!layer.draw(&mut ctx, &tile));
    }

    #[test]
    fn invisible_layer_settles_tiles_empty() {
        let registry = StyleRegistry::new();
        let source = StubSource::new(GeometryType::Point, vec![item(1, &[(0.0, 0.0)])]);
        let mut layer = FeatureLayer::new("hidden", &settings());
        layer.set_source(source.clone(), &registry);
        layer.set_visible(false);

        let tile = gl_tile(0, 0, 1);
        assert!(layer.fill(&tile, 0.0));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(layer.cache().with_entry(tile.tile(), |e| e.is_none()).unwrap());
    }

    #[test]
    fn selection_is_drawn_with_selection_style() {
        let registry = StyleRegistry::new();
        let mut ctx = RecordingContext::new();
        let source = StubSource::new(
            GeometryType::Point,
            vec![item(1, &[(0.0, 0.0)]), item(2, &[(1.0, 1.0)])],
        );
        let mut selection = SelectionStyles::default();
        selection.point = Style::simple_point();
        let mut layer = FeatureLayer::selectable("sel", &settings(), selection);
        layer.set_source(source, &registry);
        layer.set_selected_ids(BTreeSet::from([2]));

        let tile = gl_tile(0, 0, 1);
        assert!(layer.fill(&tile, 0.0));
        assert!(layer.draw_selection(&mut ctx, &tile));
        assert_eq!(ctx.draws().len(), 1);
        assert_eq!(ctx.draws()[0].0, Primitive::Points);
    }

    #[test]
    fn layer_style_survives_save_and_load() {
        let registry = StyleRegistry::new();
        let mut layer = FeatureLayer::new("roads", &settings());
        layer.set_source(StubSource::new(GeometryType::LineString, Vec::new()), &registry);
        layer.style_mut().unwrap().set_color(crate::render::style::Rgba::new(1, 2, 3, 4));
        let saved = layer.save();
        assert_eq!(saved["style_name"], json!("simpleLine"));
        assert_eq!(saved["type"], json!("vector"));

        let mut restored = FeatureLayer::new("x", &settings());
        restored.load(&saved, &registry).unwrap();
        assert_eq!(restored.name(), "roads");
        assert_eq!(restored.style(), layer.style());
    }

    fn raster(fail: bool) -> Arc<MemoryRaster> {
        let extent = tile_extent(&Tile::new(0, 0, 1));
        let band = vec![7u8; 16 * 16];
        let mut raster = MemoryRaster::new("dem", 16, 16, vec![band.clone(), band.clone(), band], extent);
        raster.fail_reads = fail;
        Arc::new(raster)
    }

    #[test]
    fn raster_fill_builds_textured_quad() {
        let mut layer = RasterLayer::new("r", &settings());
        layer.transparency = 55;
        layer.set_raster(raster(false));
        let tile = gl_tile(0, 0, 1);
        assert!(layer.fill(&tile, 0.5, false));

        layer
            .cache()
            .with_entry(tile.tile(), |entry| {
                let Some(TileObject::Raster { buffer, image }) = entry else {
                    panic!("raster tile expected");
                };
                assert_eq!(buffer.indices(), &[0, 1, 2, 0, 2, 3]);
                assert_eq!(&buffer.vertices()[2..5], &[0.5, 0.0, 1.0]);
                // Small raster is read at full resolution.
                assert_eq!((image.width, image.height), (16, 16));
                assert!(image.smooth);
                assert_eq!(&image.pixels[..4], &[7, 7, 7, 200]);
            })
            .unwrap();
    }

    #[test]
    fn raster_outside_tile_is_empty() {
        let mut layer = RasterLayer::new("r", &settings());
        let extent = tile_extent(&Tile::new(0, 0, 2));
        layer.set_raster(Arc::new(MemoryRaster::new("corner", 4, 4, vec![vec![0; 16]], extent)));
        // Opposite corner of the world; the grown tile still misses the raster.
        let tile = gl_tile(3, 3, 2);
        assert!(layer.fill(&tile, 0.0, false));
        assert!(layer.cache().with_entry(tile.tile(), |e| e.is_none()).unwrap());
    }

    #[test]
    fn failed_raster_read_retries_until_last_try() {
        let mut layer = RasterLayer::new("r", &settings());
        layer.set_raster(raster(true));
        let tile = gl_tile(0, 0, 1);
        assert!(!layer.fill(&tile, 0.0, false));
        assert!(!layer.cache().contains(tile.tile()));
        assert!(layer.fill(&tile, 0.0, true));
        assert!(layer.cache().with_entry(tile.tile(), |e| e.is_none()).unwrap());
    }

    #[test]
    fn four_band_raster_uses_alpha_band() {
        let mut layer = RasterLayer::new("r", &settings());
        let extent = tile_extent(&Tile::new(0, 0, 1));
        let band = vec![1u8; 4];
        layer.set_raster(Arc::new(MemoryRaster::new(
            "rgba",
            2,
            2,
            vec![band.clone(), band.clone(), band.clone(), band],
            extent,
        )));
        assert_eq!(layer.alpha, 4);
        let saved = layer.save();
        assert_eq!(saved["raster"]["alpha"], json!(4));

        let mut restored = RasterLayer::new("x", &settings());
        restored.load(&saved).unwrap();
        assert_eq!((restored.red, restored.alpha), (1, 4));
    }

    #[test]
    fn overview_shrinks_large_reads() {
        let mut raster = MemoryRaster::new(
            "big",
            1024,
            1024,
            vec![vec![0u8; 1024 * 1024]],
            Envelope::new(0.0, 0.0, 1024.0, 1024.0),
        );
        raster.overviews = vec![2, 4, 8];
        let window = PixelWindow {
            x: 0,
            y: 0,
            width: 1024,
            height: 1024,
        };
        assert_eq!(raster.best_overview(&window, 200, 200), Some((256, 256)));
        assert_eq!(raster.best_overview(&window, 1000, 1000), None);
    }
}
