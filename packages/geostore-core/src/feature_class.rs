use geo::Simplify;
use geo_types::Geometry;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dataset::{AuxTable, Dataset, NG_ADDITIONS_KEY};
use crate::error::{GeoStoreError, Result, ResultCode};
use crate::geometry::{self, Envelope, GeometryType, WORLD_MAX, WORLD_WIDTH};
use crate::options::{self, Options};
use crate::progress::Progress;
use crate::store::{AttributeFilter, Feature};
use crate::table::{Table, NOT_FOUND};
use crate::tile::{self, Tile, VectorTile, VectorTileItem, TILE_RESIZE};

/// Tile edge in pixels used to derive simplification tolerances.
pub const TILE_SIZE: i32 = 256;

pub const ZOOM_LEVELS_KEY: &str = "zoom_levels";

// Overview table columns
pub(crate) const OVR_X_FIELD: &str = "x";
pub(crate) const OVR_Y_FIELD: &str = "y";
pub(crate) const OVR_ZOOM_FIELD: &str = "z";
pub(crate) const OVR_TILE_FIELD: &str = "tile";

/// A table whose rows carry geometry of one declared type.
pub struct FeatureClass {
    table: Table,
    geometry_type: GeometryType,
    srs: Option<u32>,
    extent: RwLock<Option<Envelope>>,
    zoom_levels: RwLock<Option<BTreeSet<u8>>>,
    creating_overviews: AtomicBool,
}

impl std::fmt::Debug for FeatureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureClass")
            .field("name", &self.table.name())
            .field("geometry_type", &self.geometry_type)
            .field("srs", &self.srs)
            .finish()
    }
}

impl Deref for FeatureClass {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.table
    }
}

impl FeatureClass {
    pub(crate) fn new(table: Table, geometry_type: GeometryType, srs: Option<u32>) -> Self {
        Self {
            table,
            geometry_type,
            srs,
            extent: RwLock::new(None),
            zoom_levels: RwLock::new(None),
            creating_overviews: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    pub fn srs(&self) -> Option<u32> {
        self.srs
    }

    fn all_features(&self) -> Result<Vec<Feature>> {
        let name = self.name().to_string();
        self.with_store(|store| store.features(&name, None))
    }

    /// Types to create when this layer is copied somewhere.
    ///
    /// Layers of unknown or collection type are scanned and every point,
    /// line and polygon family present is returned in that order, as multi
    /// if any multi geometry of that family exists.
    pub fn geometry_types(&self) -> Vec<GeometryType> {
        if !matches!(
            self.geometry_type,
            GeometryType::Unknown | GeometryType::GeometryCollection
        ) {
            return vec![self.geometry_type];
        }

        let mut counts: BTreeMap<GeometryType, usize> = BTreeMap::new();
        for feature in self.all_features().unwrap_or_default() {
            if let Some(geom) = &feature.geometry {
                *counts.entry(GeometryType::of(geom)).or_default() += 1;
            }
        }
        let has = |ty: GeometryType| counts.get(&ty).copied().unwrap_or(0) > 0;

        let families = [
            (GeometryType::Point, GeometryType::MultiPoint),
            (GeometryType::LineString, GeometryType::MultiLineString),
            (GeometryType::Polygon, GeometryType::MultiPolygon),
        ];
        families
            .into_iter()
            .filter(|(single, multi)| has(*single) || has(*multi))
            .map(|(single, multi)| if has(multi) { multi } else { single })
            .collect()
    }

    /// Copy every feature of `src` into this layer.
    ///
    /// `filter_type` of `None` accepts any geometry. Otherwise only features
    /// whose type, promoted to multi when `FORCE_GEOMETRY_TO_MULTI` is set,
    /// equals it are copied; a multi filter also takes the single type of
    /// the same family.
    pub fn copy_features(
        &self,
        src: &FeatureClass,
        field_map: &[i32],
        filter_type: Option<GeometryType>,
        progress: &Progress,
        options: &Options,
    ) -> Result<()> {
        progress.on_progress(
            ResultCode::InProcess,
            0.0,
            &format!(
                "Start copy features from '{}' to '{}'",
                src.name(),
                self.name()
            ),
        );

        let skip_empty = options.as_bool(options::SKIP_EMPTY_GEOMETRY, false);
        let skip_invalid = options.as_bool(options::SKIP_INVALID_GEOMETRY, false);
        let to_multi = options.as_bool(options::FORCE_GEOMETRY_TO_MULTI, false);

        let _batch = self.dataset().map(|d| d.batch_guard());
        let rows = src.all_features()?;
        let total = rows.len().max(1) as f64;
        let mut counter = 0usize;
        for row in rows {
            let complete = counter as f64 / total;
            if !progress.on_progress(ResultCode::InProcess, complete, "Copy in process ...") {
                return Err(GeoStoreError::Canceled);
            }

            let mut dst = self.create_feature();
            match &row.geometry {
                None if skip_empty => continue,
                None => {}
                Some(geom) => {
                    if skip_empty && geometry::is_empty(geom) {
                        continue;
                    }
                    if skip_invalid && !geometry::is_valid(geom) {
                        continue;
                    }
                    let geom_type = GeometryType::of(geom);
                    let promoted = if to_multi { geom_type.to_multi() } else { geom_type };
                    if filter_type.map_or(false, |filter| {
                        filter != promoted && filter != promoted.to_multi()
                    }) {
                        continue;
                    }
                    dst.geometry = Some(if geom_type != self.geometry_type {
                        geometry::force_to(geom.clone(), self.geometry_type)
                    } else {
                        geom.clone()
                    });
                }
            }
            dst.set_fields_from(&row, field_map);

            if let Err(err) = self.insert_feature(&mut dst, false) {
                debug!(layer = %self.name(), error = %err, "copy insert failed");
                let message = format!(
                    "Create feature failed. Source feature FID:{}",
                    row.fid.unwrap_or(NOT_FOUND)
                );
                if !progress.on_progress(ResultCode::Warning, complete, &message) {
                    return Err(GeoStoreError::Canceled);
                }
            }
            counter += 1;
        }

        progress.on_progress(
            ResultCode::Finished,
            1.0,
            &format!("Done. Copied {} features", counter),
        );
        Ok(())
    }

    /// Union of all feature envelopes, grown on insert and update.
    pub fn extent(&self) -> Envelope {
        if let Some(extent) = *self.extent.read() {
            return extent;
        }
        let mut extent = Envelope::default();
        for feature in self.all_features().unwrap_or_default() {
            if let Some(env) = feature.geometry.as_ref().and_then(Envelope::of) {
                extent.merge(&env);
            }
        }
        *self.extent.write() = Some(extent);
        extent
    }

    fn merge_extent(&self, env: &Envelope) {
        let mut extent = self.extent();
        extent.merge(env);
        *self.extent.write() = Some(extent);
    }

    /// Simplification tolerance in world units for one pixel at `zoom`.
    pub fn pixel_size(zoom: u8, precise: bool) -> f64 {
        let tiles_in_dim = 2f64.powi(zoom as i32);
        let tile_size = if precise {
            TILE_SIZE * 2
        } else {
            // Coarser grid on low zooms thins out point layers
            TILE_SIZE - (20 - zoom as i32) * 8
        };
        WORLD_WIDTH / (tiles_in_dim * tile_size as f64)
    }

    /// `env` grown by the extra margin a resized tile covers at `zoom`.
    pub fn extra_extent_for_zoom(zoom: u8, env: &Envelope) -> Envelope {
        let half = 2f64.powi(zoom as i32) * 0.5;
        let tile_size = WORLD_MAX / half;
        let extra = tile_size * TILE_RESIZE - tile_size;
        let mut extent = *env;
        extent.grow(extra);
        extent
    }

    pub fn zoom_levels(&self) -> BTreeSet<u8> {
        if let Some(levels) = self.zoom_levels.read().as_ref() {
            return levels.clone();
        }
        let levels = parse_zoom_levels(&self.property(ZOOM_LEVELS_KEY, "", NG_ADDITIONS_KEY));
        *self.zoom_levels.write() = Some(levels.clone());
        levels
    }

    fn overviews_table(&self) -> Option<(Arc<Dataset>, AuxTable)> {
        let dataset = self.dataset()?;
        let table = dataset.get_overviews_table(self.name())?;
        Some((dataset, table))
    }

    pub fn has_overviews(&self) -> bool {
        self.overviews_table().is_some()
    }

    fn is_precise(&self, geom: Option<&Geometry<f64>>) -> bool {
        let ty = geom.map_or(self.geometry_type, GeometryType::of);
        !ty.is_point()
    }

    /// Pre-tile every feature for the zoom levels in `ZOOM_LEVELS`.
    ///
    /// Existing overviews are kept unless `FORCE` is set. Tiling runs on the
    /// rayon pool; storing runs in one batch under the SQL lock.
    pub fn create_overviews(&self, progress: &Progress, options: &Options) -> Result<()> {
        if !options.as_bool(options::FORCE, false) && self.has_overviews() {
            return Ok(());
        }
        let Some(dataset) = self.dataset() else {
            progress.on_progress(ResultCode::CreateFailed, 0.0, "Unsupported feature class");
            return Err(GeoStoreError::Unsupported(self.name().to_string()));
        };

        let table = match dataset.get_overviews_table(self.name()) {
            Some(table) => {
                dataset.clear_overviews_table(self.name())?;
                table
            }
            None => dataset.create_overviews_table(self.name())?,
        };

        let levels_value = options.as_string(options::ZOOM_LEVELS, "");
        let levels = parse_zoom_levels(&levels_value);
        *self.zoom_levels.write() = Some(levels.clone());
        if levels.is_empty() {
            return Ok(());
        }
        let stored = levels
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.set_property(ZOOM_LEVELS_KEY, &stored, NG_ADDITIONS_KEY)?;

        progress.on_progress(
            ResultCode::InProcess,
            0.0,
            "Start tiling and simplifying geometry",
        );
        let mut step_progress = progress.clone();
        step_progress.set_total_steps(2);
        step_progress.set_step(0);

        let features = self.all_features()?;
        let total = features.len().max(1) as f64;
        let done = AtomicUsize::new(0);
        let canceled = AtomicBool::new(false);
        let tile_one = |feature: &Feature| -> Vec<(Tile, Vec<VectorTileItem>)> {
            if canceled.load(Ordering::Relaxed) {
                return Vec::new();
            }
            let out = match (feature.fid, feature.geometry.as_ref()) {
                (Some(fid), Some(geom)) => tile_feature(fid, geom, &levels),
                _ => Vec::new(),
            };
            let count = done.fetch_add(1, Ordering::Relaxed) + 1;
            if !step_progress.on_progress(ResultCode::InProcess, count as f64 / total, "Tiling ...") {
                canceled.store(true, Ordering::Relaxed);
            }
            out
        };

        let threads = dataset.settings().threads;
        let generated: Vec<Vec<(Tile, Vec<VectorTileItem>)>> = if threads > 0 {
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(|| features.par_iter().map(&tile_one).collect()),
                Err(err) => {
                    warn!(error = %err, "tiling pool unavailable, using global pool");
                    features.par_iter().map(&tile_one).collect()
                }
            }
        } else {
            features.par_iter().map(&tile_one).collect()
        };
        if canceled.load(Ordering::Relaxed) {
            return Err(GeoStoreError::Canceled);
        }

        let mut tiles: BTreeMap<Tile, VectorTile> = BTreeMap::new();
        for (tile, items) in generated.into_iter().flatten() {
            tiles.entry(tile).or_default().add(items, false);
        }

        self.creating_overviews.store(true, Ordering::SeqCst);
        step_progress.set_step(1);
        let saved = self.save_overview_tiles(&dataset, &table, &tiles, &step_progress);
        self.creating_overviews.store(false, Ordering::SeqCst);
        saved?;

        info!(layer = %self.name(), tiles = tiles.len(), "overviews created");
        progress.on_progress(
            ResultCode::Finished,
            1.0,
            "Finish tiling and simplifying geometry",
        );
        Ok(())
    }

    fn save_overview_tiles(
        &self,
        dataset: &Dataset,
        table: &AuxTable,
        tiles: &BTreeMap<Tile, VectorTile>,
        progress: &Progress,
    ) -> Result<()> {
        let _lock = dataset.lock_execute_sql()?;
        let _batch = dataset.batch_guard();
        let total = tiles.len().max(1) as f64;
        for (counter, (tile, vtile)) in tiles.iter().enumerate() {
            if !vtile.is_valid() || vtile.is_empty() {
                continue;
            }
            let mut row = table.create_row();
            row.set_field(0, tile.x);
            row.set_field(1, tile.y);
            row.set_field(2, tile.z as i32);
            row.set_field(3, vtile.save()?);
            if let Err(err) = table.create(&mut row) {
                progress.on_progress(ResultCode::InsertFailed, 0.0, "Failed to create feature");
                warn!(layer = %self.name(), error = %err, "overview tile insert failed");
            }
            progress.on_progress(
                ResultCode::InProcess,
                counter as f64 / total,
                "Save tiles ...",
            );
        }
        Ok(())
    }

    fn tile_row(table: &AuxTable, tile: &Tile) -> Option<Feature> {
        let filter = AttributeFilter::eq(OVR_X_FIELD, tile.x)
            .and_eq(OVR_Y_FIELD, tile.y)
            .and_eq(OVR_ZOOM_FIELD, tile.z as i32);
        table.features(Some(&filter)).ok()?.into_iter().next()
    }

    fn load_tile(row: &Feature) -> VectorTile {
        match row.field(3).as_binary().map(VectorTile::load) {
            Some(Ok(vtile)) => vtile,
            Some(Err(err)) => {
                debug!(error = %err, "stored overview tile unreadable");
                VectorTile::new()
            }
            None => VectorTile::new(),
        }
    }

    /// Vector tile for `tile`, clipped to `extent`.
    ///
    /// Stored overviews serve zooms up to the highest overview level; other
    /// zooms are tiled from the features on the fly.
    pub fn get_tile(&self, tile: &Tile, extent: &Envelope) -> VectorTile {
        if self.dataset().is_none() || self.creating_overviews.load(Ordering::SeqCst) {
            return VectorTile::new();
        }
        if !self.extent().intersects(extent) {
            return VectorTile::new();
        }

        if let Some((dataset, table)) = self.overviews_table() {
            if self.zoom_levels().last().map_or(false, |max| tile.z <= *max) {
                let Ok(_lock) = dataset.lock_execute_sql() else {
                    return VectorTile::new();
                };
                return Self::tile_row(&table, tile)
                    .map(|row| Self::load_tile(&row))
                    .unwrap_or_default();
            }
        }

        debug!(layer = %self.name(), z = tile.z, x = tile.x, y = tile.y, "tiling on the fly");
        let step = Self::pixel_size(tile.z, self.is_precise(None));
        let features = match self.all_features() {
            Ok(features) => features,
            Err(err) => {
                debug!(layer = %self.name(), error = %err, "tile features unavailable");
                return VectorTile::new();
            }
        };

        let mut vtile = VectorTile::new();
        for feature in features.iter().rev() {
            let (Some(fid), Some(geom)) = (feature.fid, feature.geometry.as_ref()) else {
                continue;
            };
            if !Envelope::of(geom).map_or(false, |env| env.intersects(extent)) {
                continue;
            }
            let items = tile::tile_geometry(fid, &simplify(geom, step), extent);
            if !items.is_empty() {
                vtile.add(items, false);
            }
        }
        vtile
    }

    // Rewrite the stored tiles touched by `env` for feature `fid`.
    fn update_overviews(&self, fid: i64, geom: Option<&Geometry<f64>>, env: &Envelope, remove: bool) {
        if self.dataset().map_or(true, |d| d.is_batch_operation()) {
            return;
        }
        let Some((dataset, table)) = self.overviews_table() else {
            return;
        };
        let precise = self.is_precise(geom);

        for zoom in self.zoom_levels().into_iter().rev() {
            let extent = Self::extra_extent_for_zoom(zoom, env);
            let simplified = geom.map(|g| simplify(g, Self::pixel_size(zoom, precise)));
            for tile in unique_tiles(&extent, zoom) {
                let Ok(_lock) = dataset.lock_execute_sql() else {
                    return;
                };
                let row = Self::tile_row(&table, &tile.tile);
                let mut vtile = row.as_ref().map(Self::load_tile).unwrap_or_default();
                if remove {
                    vtile.remove(fid);
                }
                if let Some(geom) = &simplified {
                    let mut clip = tile.env;
                    clip.resize(TILE_RESIZE);
                    vtile.add(tile::tile_geometry(fid, geom, &clip), true);
                }

                let result = match (vtile.is_valid(), row) {
                    (true, row) => vtile.save().and_then(|blob| {
                        let mut row = row.unwrap_or_else(|| {
                            let mut row = table.create_row();
                            row.set_field(0, tile.tile.x);
                            row.set_field(1, tile.tile.y);
                            row.set_field(2, tile.tile.z as i32);
                            row
                        });
                        row.set_field(3, blob);
                        if row.fid.is_some() {
                            table.set(&row)
                        } else {
                            table.create(&mut row).map(|_| ())
                        }
                    }),
                    (false, Some(row)) => match row.fid {
                        Some(id) => table.delete(id),
                        None => Ok(()),
                    },
                    (false, None) => Ok(()),
                };
                if let Err(err) = result {
                    debug!(layer = %self.name(), error = %err, "overview tile update failed");
                }
            }
        }
    }

    pub fn insert_feature(&self, feature: &mut Feature, log_edits: bool) -> Result<()> {
        self.table.insert_feature(feature, log_edits)?;
        let Some(geom) = feature.geometry.as_ref() else {
            return Ok(());
        };
        let Some(mut env) = Envelope::of(geom) else {
            return Ok(());
        };
        env.fix();
        self.merge_extent(&env);
        if let Some(fid) = feature.fid {
            self.update_overviews(fid, Some(geom), &env, false);
        }
        Ok(())
    }

    pub fn update_feature(&self, feature: &Feature, log_edits: bool) -> Result<()> {
        let Some(fid) = feature.fid else {
            return self.table.update_feature(feature, log_edits);
        };
        let Some(previous) = self.get_feature(fid) else {
            return self.table.update_feature(feature, log_edits);
        };

        let mut env = Envelope::default();
        for geom in [previous.geometry.as_ref(), feature.geometry.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(part) = Envelope::of(geom) {
                env.merge(&part);
            }
        }
        env.fix();

        self.table.update_feature(feature, log_edits)?;
        self.merge_extent(&env);
        self.update_overviews(fid, feature.geometry.as_ref(), &env, true);
        Ok(())
    }

    pub fn delete_feature(&self, fid: i64, log_edits: bool) -> Result<()> {
        let env = self
            .get_feature(fid)
            .and_then(|f| f.geometry.as_ref().and_then(Envelope::of));
        self.table.delete_feature(fid, log_edits)?;
        if let Some(env) = env {
            self.update_overviews(fid, None, &env, true);
        }
        Ok(())
    }

    pub fn delete_features(&self, log_edits: bool) -> Result<()> {
        self.table.delete_features(log_edits)?;
        *self.extent.write() = Some(Envelope::default());
        if let Some(dataset) = self.dataset() {
            if dataset.get_overviews_table(self.name()).is_some() {
                dataset.clear_overviews_table(self.name())?;
            }
        }
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        let dataset = self.dataset().ok_or(GeoStoreError::NotOpened)?;
        self.table.destroy()?;
        // The overviews table may not exist
        let _ = dataset.destroy_overviews_table(self.name());
        Ok(())
    }
}

/// Parse a comma separated zoom list, ignoring bad entries and levels past
/// [`tile::MAX_ZOOM`].
pub fn parse_zoom_levels(value: &str) -> BTreeSet<u8> {
    value
        .split(',')
        .filter_map(|z| z.trim().parse::<u8>().ok())
        .filter(|z| {
            if *z > tile::MAX_ZOOM {
                warn!(zoom = z, max = tile::MAX_ZOOM, "zoom level dropped");
                return false;
            }
            true
        })
        .collect()
}

/// Simplify with tolerance `step`. Points are returned unchanged.
pub fn simplify(geom: &Geometry<f64>, step: f64) -> Geometry<f64> {
    match geom {
        Geometry::LineString(g) => g.simplify(&step).into(),
        Geometry::MultiLineString(g) => g.simplify(&step).into(),
        Geometry::Polygon(g) => g.simplify(&step).into(),
        Geometry::MultiPolygon(g) => g.simplify(&step).into(),
        Geometry::GeometryCollection(g) => Geometry::GeometryCollection(
            g.0.iter().map(|part| simplify(part, step)).collect(),
        ),
        other => other.clone(),
    }
}

// Wrapped copies share the stored row of their real tile.
fn unique_tiles(extent: &Envelope, zoom: u8) -> Vec<tile::TileItem> {
    let mut seen = BTreeSet::new();
    tile::tiles_for_extent(extent, zoom, true)
        .into_iter()
        .map(|mut item| {
            item.tile.cross_extent = 0;
            item
        })
        .filter(|item| seen.insert(item.tile))
        .collect()
}

fn tile_feature(fid: i64, geom: &Geometry<f64>, levels: &BTreeSet<u8>) -> Vec<(Tile, Vec<VectorTileItem>)> {
    let Some(env) = Envelope::of(geom) else {
        return Vec::new();
    };
    let precise = !GeometryType::of(geom).is_point();
    let mut out = Vec::new();
    for &zoom in levels.iter().rev() {
        let extent = FeatureClass::extra_extent_for_zoom(zoom, &env);
        let simplified = simplify(geom, FeatureClass::pixel_size(zoom, precise));
        for item in unique_tiles(&extent, zoom) {
            let mut clip = item.env;
            clip.resize(TILE_RESIZE);
            let items = tile::tile_geometry(fid, &simplified, &clip);
            if !items.is_empty() {
                out.push((item.tile, items));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::notify::Notify;
    use crate::store::{FieldDefn, FieldType, MemoryDriver};
    use geo_types::{line_string, point, polygon, MultiLineString, MultiPoint};
    use std::path::Path;

    fn dataset(dir: &Path) -> Arc<Dataset> {
        Dataset::create(
            &dir.join("data.ngst"),
            Arc::new(MemoryDriver::database()),
            Settings::default().with_threads(2),
            Arc::new(Notify::new()),
        )
        .unwrap()
    }

    fn layer(dataset: &Arc<Dataset>, name: &str, ty: GeometryType) -> Arc<FeatureClass> {
        dataset
            .create_feature_class(
                name,
                ty,
                Some(3857),
                &[FieldDefn::new("name", FieldType::String)],
                &Options::new(),
                &Progress::default(),
            )
            .unwrap()
    }

    fn add(fc: &FeatureClass, geom: Geometry<f64>) -> i64 {
        let mut f = fc.create_feature();
        f.set_field(0, "f");
        f.geometry = Some(geom);
        fc.insert_feature(&mut f, false).unwrap();
        f.fid.unwrap()
    }

    #[test]
    fn pixel_size_scales_with_zoom() {
        assert_eq!(FeatureClass::pixel_size(0, true), WORLD_WIDTH / 512.0);
        assert_eq!(FeatureClass::pixel_size(1, true), WORLD_WIDTH / 1024.0);
        assert_eq!(FeatureClass::pixel_size(20, false), WORLD_WIDTH / (1048576.0 * 256.0));
        assert!(FeatureClass::pixel_size(5, false) > FeatureClass::pixel_size(5, true));
    }

    #[test]
    fn zoom_list_parsing() {
        assert_eq!(parse_zoom_levels("3, 1,bad,7"), BTreeSet::from([1, 3, 7]));
        assert_eq!(parse_zoom_levels("2,24,25,40,300"), BTreeSet::from([2, 24]));
        assert!(parse_zoom_levels("").is_empty());
    }

    #[test]
    fn geometry_types_of_mixed_layer() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let mixed = layer(&ds, "mixed", GeometryType::Unknown);
        add(&mixed, point!(x: 1.0, y: 1.0).into());
        add(&mixed, MultiPoint(vec![point!(x: 2.0, y: 2.0)]).into());
        add(&mixed, line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)].into());
        assert_eq!(
            mixed.geometry_types(),
            vec![GeometryType::MultiPoint, GeometryType::LineString]
        );

        let multi_only = layer(&ds, "multi_only", GeometryType::Unknown);
        add(
            &multi_only,
            MultiLineString(vec![line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]]).into(),
        );
        assert_eq!(multi_only.geometry_types(), vec![GeometryType::MultiLineString]);

        let lines = layer(&ds, "lines", GeometryType::Unknown);
        add(&lines, line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)].into());
        assert_eq!(lines.geometry_types(), vec![GeometryType::LineString]);

        let typed = layer(&ds, "typed", GeometryType::Polygon);
        assert_eq!(typed.geometry_types(), vec![GeometryType::Polygon]);
    }

    #[test]
    fn copy_filters_and_coerces() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let src = layer(&ds, "src", GeometryType::Unknown);
        add(&src, point!(x: 1.0, y: 1.0).into());
        add(&src, line_string![(x: 0.0, y: 0.0)].into());
        let mut empty = src.create_feature();
        src.insert_feature(&mut empty, false).unwrap();

        let dst = layer(&ds, "dst", GeometryType::MultiPoint);
        let options = Options::new()
            .with(options::SKIP_EMPTY_GEOMETRY, "YES")
            .with(options::FORCE_GEOMETRY_TO_MULTI, "YES");
        dst.copy_features(&src, &[0], Some(GeometryType::MultiPoint), &Progress::default(), &options)
            .unwrap();
        let rows = dst.features().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0].geometry, Some(Geometry::MultiPoint(_))));

        let all = layer(&ds, "all", GeometryType::Unknown);
        let skip_invalid = Options::new().with(options::SKIP_INVALID_GEOMETRY, "YES");
        all.copy_features(&src, &[0], None, &Progress::default(), &skip_invalid)
            .unwrap();
        assert_eq!(all.feature_count(), 2);
    }

    #[test]
    fn extent_follows_edits() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let fc = layer(&ds, "pts", GeometryType::Point);
        assert!(!fc.extent().is_init());
        add(&fc, point!(x: 1.0, y: 2.0).into());
        let fid = add(&fc, point!(x: 5.0, y: 6.0).into());
        let extent = fc.extent();
        assert!(extent.contains(&Envelope::new(1.0, 2.0, 5.0, 6.0)));

        let mut moved = fc.get_feature(fid).unwrap();
        moved.geometry = Some(point!(x: 10.0, y: 10.0).into());
        fc.update_feature(&moved, false).unwrap();
        assert!(fc.extent().contains(&Envelope::new(1.0, 2.0, 10.0, 10.0)));
    }

    #[test]
    fn overviews_are_created_and_maintained() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let fc = layer(&ds, "areas", GeometryType::Polygon);
        let first = add(
            &fc,
            polygon![
                (x: 1000.0, y: 1000.0),
                (x: 500000.0, y: 1000.0),
                (x: 500000.0, y: 500000.0),
                (x: 1000.0, y: 1000.0),
            ]
            .into(),
        );
        assert!(!fc.has_overviews());

        let options = Options::new().with(options::ZOOM_LEVELS, "1,3");
        fc.create_overviews(&Progress::default(), &options).unwrap();
        assert!(fc.has_overviews());
        assert_eq!(fc.zoom_levels(), BTreeSet::from([1, 3]));
        assert_eq!(fc.property(ZOOM_LEVELS_KEY, "", NG_ADDITIONS_KEY), "1,3");

        let tile = Tile::new(1, 1, 1);
        let stored = fc.get_tile(&tile, &tile::tile_extent(&tile));
        assert!(stored.is_valid());
        assert!(stored.items().iter().any(|i| i.ids.contains(&first)));

        // A second polygon lands in the stored tile without regeneration
        let second = add(
            &fc,
            polygon![
                (x: 2000.0, y: 2000.0),
                (x: 400000.0, y: 2000.0),
                (x: 2000.0, y: 400000.0),
                (x: 2000.0, y: 2000.0),
            ]
            .into(),
        );
        let stored = fc.get_tile(&tile, &tile::tile_extent(&tile));
        assert!(stored.items().iter().any(|i| i.ids.contains(&second)));

        fc.delete_feature(second, false).unwrap();
        let stored = fc.get_tile(&tile, &tile::tile_extent(&tile));
        assert!(stored.items().iter().all(|i| !i.ids.contains(&second)));

        // Beyond the highest level tiles are built on the fly
        let deep = Tile::new(64, 64, 7);
        let on_the_fly = fc.get_tile(&deep, &tile::tile_extent(&deep));
        assert!(on_the_fly.items().iter().all(|i| i.ids.contains(&first)));

        // Kept unless forced
        fc.create_overviews(&Progress::default(), &Options::new()).unwrap();
        assert_eq!(fc.zoom_levels(), BTreeSet::from([1, 3]));

        fc.delete_features(false).unwrap();
        assert!(fc.get_tile(&tile, &tile::tile_extent(&tile)).is_empty());
    }

    #[test]
    fn tile_outside_extent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let fc = layer(&ds, "pts", GeometryType::Point);
        add(&fc, point!(x: 100.0, y: 100.0).into());
        let far = Tile::new(0, 0, 4);
        assert!(fc.get_tile(&far, &tile::tile_extent(&far)).is_empty());
        let near = Tile::new(8, 8, 4);
        let vtile = fc.get_tile(&near, &tile::tile_extent(&near));
        assert_eq!(vtile.items().len(), 1);
    }

    #[test]
    fn overviews_skip_levels_past_max_zoom() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let fc = layer(&ds, "pts", GeometryType::Point);
        add(&fc, point!(x: 100.0, y: 100.0).into());

        fc.create_overviews(&Progress::default(), &Options::new().with(options::ZOOM_LEVELS, "40"))
            .unwrap();
        assert!(fc.zoom_levels().is_empty());

        let options = Options::new()
            .with(options::ZOOM_LEVELS, "2,40")
            .with(options::FORCE, "ON");
        fc.create_overviews(&Progress::default(), &options).unwrap();
        assert_eq!(fc.zoom_levels(), BTreeSet::from([2]));
        assert_eq!(fc.property(ZOOM_LEVELS_KEY, "", NG_ADDITIONS_KEY), "2");

        let deep = Tile::new(0, 0, 40);
        assert!(fc.get_tile(&deep, &tile::tile_extent(&deep)).is_empty());
    }

    #[test]
    fn destroy_drops_overviews() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path());
        let fc = layer(&ds, "gone", GeometryType::Point);
        add(&fc, point!(x: 1.0, y: 1.0).into());
        fc.create_overviews(&Progress::default(), &Options::new().with(options::ZOOM_LEVELS, "2"))
            .unwrap();
        fc.destroy().unwrap();
        assert!(ds.get_overviews_table("gone").is_none());
        assert!(ds.get_child("gone").is_none());
    }
}
