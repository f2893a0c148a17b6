use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dataset::Dataset;
use crate::error::{GeoStoreError, Result};
use crate::geometry::{Envelope, DEFAULT_BOUNDS};
use crate::notify::{ChangeCode, Notify};
use crate::render::layer::{
    FeatureLayer, LayerType, RasterLayer, RasterSource, SelectionStyles, VectorTileSource,
};
use crate::render::style::{Rgba, StyleRegistry};

pub const DEFAULT_MAP_NAME: &str = "new map";
pub const DEFAULT_LAYER_NAME: &str = "new layer";
pub const DEFAULT_EPSG: u16 = 3857;
pub const DEFAULT_MAP_BACKGROUND: Rgba = Rgba::new(210, 245, 255, 255);

/// Reserved map id, never handed out.
pub const INVALID_MAP_ID: u8 = 0;

/// Finds the data behind a saved layer.
pub trait LayerResolver {
    fn feature_source(&self, path: &Path, name: &str) -> Option<Arc<dyn VectorTileSource>>;

    fn raster_source(&self, _path: &Path) -> Option<Arc<dyn RasterSource>> {
        None
    }
}

/// Resolves feature layers against a fixed set of open datasets.
#[derive(Default)]
pub struct DatasetResolver {
    datasets: Vec<Arc<Dataset>>,
}

impl DatasetResolver {
    pub fn new(datasets: Vec<Arc<Dataset>>) -> Self {
        Self { datasets }
    }
}

impl LayerResolver for DatasetResolver {
    fn feature_source(&self, path: &Path, name: &str) -> Option<Arc<dyn VectorTileSource>> {
        let dataset = self.datasets.iter().find(|ds| ds.path() == path)?;
        let child = dataset.get_child(name)?;
        let feature_class = child.as_feature_class()?.clone();
        Some(feature_class)
    }
}

#[derive(Debug)]
pub enum MapLayer {
    Feature(FeatureLayer),
    Raster(RasterLayer),
}

impl MapLayer {
    pub fn name(&self) -> &str {
        match self {
            MapLayer::Feature(layer) => layer.name(),
            MapLayer::Raster(layer) => layer.name(),
        }
    }

    pub fn layer_type(&self) -> LayerType {
        match self {
            MapLayer::Feature(_) => LayerType::Vector,
            MapLayer::Raster(_) => LayerType::Raster,
        }
    }

    pub fn as_feature(&self) -> Option<&FeatureLayer> {
        match self {
            MapLayer::Feature(layer) => Some(layer),
            MapLayer::Raster(_) => None,
        }
    }

    pub fn as_feature_mut(&mut self) -> Option<&mut FeatureLayer> {
        match self {
            MapLayer::Feature(layer) => Some(layer),
            MapLayer::Raster(_) => None,
        }
    }

    pub fn as_raster_mut(&mut self) -> Option<&mut RasterLayer> {
        match self {
            MapLayer::Raster(layer) => Some(layer),
            MapLayer::Feature(_) => None,
        }
    }

    fn save(&self) -> Value {
        match self {
            MapLayer::Feature(layer) => layer.save(),
            MapLayer::Raster(layer) => layer.save(),
        }
    }
}

fn color_to_hex(color: Rgba) -> String {
    format!("#{:02x}{:02x}{:02x}{:02x}", color.r, color.g, color.b, color.a)
}

fn color_from_hex(hex: &str) -> Option<Rgba> {
    let digits = hex.strip_prefix('#').unwrap_or(hex);
    let channel = |i: usize| {
        digits
            .get(i * 2..i * 2 + 2)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
    };
    match digits.len() {
        6 => Some(Rgba::new(channel(0)?, channel(1)?, channel(2)?, 255)),
        8 => Some(Rgba::new(channel(0)?, channel(1)?, channel(2)?, channel(3)?)),
        _ => None,
    }
}

/// Rewrites `src.path` of a saved layer relative to `base`.
fn relativize_source(layer: &mut Value, base: &Path) {
    let Some(path) = layer.pointer("/src/path").and_then(Value::as_str) else {
        return;
    };
    if let Ok(relative) = Path::new(path).strip_prefix(base) {
        layer["src"]["path"] = json!(relative);
    }
}

fn resolve_source_path(path: &str, base: Option<&Path>) -> PathBuf {
    let path = Path::new(path);
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// A named, ordered stack of layers.
#[derive(Debug)]
pub struct Map {
    pub name: String,
    pub description: String,
    pub epsg: u16,
    pub bounds: Envelope,
    pub background: Rgba,
    /// Store layer sources relative to the map file.
    pub relative_paths: bool,
    layers: Vec<MapLayer>,
    selection: SelectionStyles,
    settings: Settings,
}

impl Map {
    pub fn new(name: &str, description: &str, epsg: u16, bounds: Envelope, settings: Settings) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            epsg,
            bounds,
            background: DEFAULT_MAP_BACKGROUND,
            relative_paths: true,
            layers: Vec::new(),
            selection: SelectionStyles::default(),
            settings,
        }
    }

    pub fn layers(&self) -> &[MapLayer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&MapLayer> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut MapLayer> {
        self.layers.get_mut(index)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn selection(&self) -> &SelectionStyles {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: SelectionStyles) {
        self.selection = selection;
    }

    /// Appends an empty layer and returns its index. Feature layers draw
    /// selections with the map's selection styles.
    pub fn create_layer(&mut self, name: &str, layer_type: LayerType) -> usize {
        let layer = match layer_type {
            LayerType::Vector => MapLayer::Feature(FeatureLayer::selectable(
                name,
                &self.settings,
                self.selection.clone(),
            )),
            LayerType::Raster => MapLayer::Raster(RasterLayer::new(name, &self.settings)),
        };
        self.layers.push(layer);
        self.layers.len() - 1
    }

    /// Adds a feature layer over `source` with its default style.
    pub fn create_feature_layer(
        &mut self,
        name: &str,
        source: Arc<dyn VectorTileSource>,
        styles: &StyleRegistry,
    ) -> usize {
        let index = self.create_layer(name, LayerType::Vector);
        if let Some(layer) = self.layers[index].as_feature_mut() {
            layer.set_source(source, styles);
        }
        index
    }

    pub fn create_raster_layer(&mut self, name: &str, raster: Arc<dyn RasterSource>) -> usize {
        let index = self.create_layer(name, LayerType::Raster);
        if let Some(layer) = self.layers[index].as_raster_mut() {
            layer.set_raster(raster);
        }
        index
    }

    pub fn delete_layer(&mut self, index: usize) -> Option<MapLayer> {
        if index >= self.layers.len() {
            return None;
        }
        Some(self.layers.remove(index))
    }

    /// Moves layer `moved` in front of layer `before`, or to the end when
    /// `before` is `None`.
    pub fn reorder_layers(&mut self, before: Option<usize>, moved: usize) -> bool {
        if moved >= self.layers.len() || before.map_or(false, |b| b >= self.layers.len()) {
            return false;
        }
        if before == Some(moved) {
            return true;
        }
        let layer = self.layers.remove(moved);
        match before {
            Some(before) => {
                let target = if before > moved { before - 1 } else { before };
                self.layers.insert(target, layer);
            }
            None => self.layers.push(layer),
        }
        true
    }

    /// Serialises the map. With relative paths on, layer sources under
    /// `base` are written relative to it.
    pub fn save(&self, base: Option<&Path>) -> Value {
        let layers: Vec<Value> = self
            .layers
            .iter()
            .map(|layer| {
                let mut saved = layer.save();
                if let (true, Some(base)) = (self.relative_paths, base) {
                    relativize_source(&mut saved, base);
                }
                saved
            })
            .collect();

        json!({
            "name": self.name,
            "descript": self.description,
            "relative_paths": self.relative_paths,
            "epsg": self.epsg,
            "bounds": self.bounds,
            "bk_color": color_to_hex(self.background),
            "selection": self.selection.save(),
            "layers": layers,
        })
    }

    /// Rebuilds a map from [`Map::save`] output. Layers whose data cannot be
    /// resolved are dropped with a warning.
    pub fn load(
        value: &Value,
        base: Option<&Path>,
        resolver: &dyn LayerResolver,
        styles: &StyleRegistry,
        settings: Settings,
    ) -> Result<Self> {
        if !value.is_object() {
            return Err(GeoStoreError::Unsupported("map document".to_string()));
        }
        let text = |key: &str, default: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let bounds = match value.get("bounds") {
            Some(bounds) => serde_json::from_value(bounds.clone())?,
            None => DEFAULT_BOUNDS,
        };
        let epsg = value
            .get("epsg")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_EPSG);

        let mut map = Map::new(
            &text("name", DEFAULT_MAP_NAME),
            &text("descript", ""),
            epsg,
            bounds,
            settings,
        );
        map.relative_paths = value
            .get("relative_paths")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if let Some(color) = value
            .get("bk_color")
            .and_then(Value::as_str)
            .and_then(color_from_hex)
        {
            map.background = color;
        }
        if let Some(selection) = value.get("selection") {
            map.selection = SelectionStyles::load(selection, styles)?;
        }

        let base = if map.relative_paths { base } else { None };
        let layers = value.get("layers").and_then(Value::as_array);
        debug!(count = layers.map_or(0, Vec::len), "opening map layers");
        for saved in layers.into_iter().flatten() {
            if let Err(err) = map.load_layer(saved, base, resolver, styles) {
                warn!(error = %err, "map layer skipped");
            }
        }
        Ok(map)
    }

    fn load_layer(
        &mut self,
        saved: &Value,
        base: Option<&Path>,
        resolver: &dyn LayerResolver,
        styles: &StyleRegistry,
    ) -> Result<()> {
        let layer_type: LayerType = match saved.get("type") {
            Some(kind) => serde_json::from_value(kind.clone())?,
            None => LayerType::Vector,
        };
        let src = saved
            .pointer("/src/path")
            .and_then(Value::as_str)
            .map(|path| resolve_source_path(path, base));

        let layer = match layer_type {
            LayerType::Vector => {
                let name = saved
                    .pointer("/src/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let path = src.ok_or_else(|| GeoStoreError::NotFound("layer source".to_string()))?;
                let source = resolver
                    .feature_source(&path, name)
                    .ok_or_else(|| GeoStoreError::NotFound(format!("{}/{}", path.display(), name)))?;
                let mut layer =
                    FeatureLayer::selectable(DEFAULT_LAYER_NAME, &self.settings, self.selection.clone());
                layer.set_source(source, styles);
                layer.load(saved, styles)?;
                MapLayer::Feature(layer)
            }
            LayerType::Raster => {
                let path = src.ok_or_else(|| GeoStoreError::NotFound("layer source".to_string()))?;
                let raster = resolver
                    .raster_source(&path)
                    .ok_or_else(|| GeoStoreError::NotFound(path.display().to_string()))?;
                let mut layer = RasterLayer::new(DEFAULT_LAYER_NAME, &self.settings);
                layer.set_raster(raster);
                layer.load(saved)?;
                MapLayer::Raster(layer)
            }
        };
        self.layers.push(layer);
        Ok(())
    }
}

/// Owns the open maps and hands out their ids (1..=255).
pub struct MapRegistry {
    maps: Vec<Option<Map>>,
    settings: Settings,
    styles: StyleRegistry,
    notify: Arc<Notify>,
}

impl MapRegistry {
    pub fn new(settings: Settings, styles: StyleRegistry, notify: Arc<Notify>) -> Self {
        Self {
            maps: Vec::new(),
            settings,
            styles,
            notify,
        }
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles
    }

    fn id_of(slot: usize) -> u8 {
        u8::try_from(slot + 1).unwrap_or(INVALID_MAP_ID)
    }

    fn slot_of(id: u8) -> Option<usize> {
        (id != INVALID_MAP_ID).then(|| usize::from(id) - 1)
    }

    /// Puts `map` in the first free slot. Returns the invalid id when all
    /// 255 are taken.
    fn insert(&mut self, map: Map) -> u8 {
        if let Some(slot) = self.maps.iter().position(Option::is_none) {
            self.maps[slot] = Some(map);
            return Self::id_of(slot);
        }
        if self.maps.len() >= usize::from(u8::MAX) {
            warn!("map registry is full");
            return INVALID_MAP_ID;
        }
        self.maps.push(Some(map));
        Self::id_of(self.maps.len() - 1)
    }

    pub fn create_map(&mut self, name: &str, description: &str, epsg: u16, bounds: Envelope) -> u8 {
        let map = Map::new(name, description, epsg, bounds, self.settings.clone());
        let id = self.insert(map);
        if id != INVALID_MAP_ID {
            self.notify.notify(&id.to_string(), ChangeCode::CreateMap);
            info!(id, name, "map created");
        }
        id
    }

    pub fn open_map(&mut self, path: &Path, resolver: &dyn LayerResolver) -> Result<u8> {
        let text = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let map = Map::load(&value, path.parent(), resolver, &self.styles, self.settings.clone())?;
        let id = self.insert(map);
        if id == INVALID_MAP_ID {
            return Err(GeoStoreError::Store("no free map id".to_string()));
        }
        debug!(id, path = %path.display(), "map opened");
        Ok(id)
    }

    pub fn save_map(&self, id: u8, path: &Path) -> Result<()> {
        let map = self
            .get_map(id)
            .ok_or_else(|| GeoStoreError::NotFound(format!("map {}", id)))?;
        let value = map.save(path.parent());
        fs::write(path, serde_json::to_string_pretty(&value)?)?;
        debug!(id, path = %path.display(), "map saved");
        Ok(())
    }

    pub fn close_map(&mut self, id: u8) -> bool {
        let Some(slot) = Self::slot_of(id).and_then(|slot| self.maps.get_mut(slot)) else {
            return false;
        };
        slot.take().is_some()
    }

    pub fn get_map(&self, id: u8) -> Option<&Map> {
        self.maps.get(Self::slot_of(id)?)?.as_ref()
    }

    pub fn get_map_mut(&mut self, id: u8) -> Option<&mut Map> {
        self.maps.get_mut(Self::slot_of(id)?)?.as_mut()
    }

    pub fn map_count(&self) -> usize {
        self.maps.iter().filter(|m| m.is_some()).count()
    }

    pub fn clear(&mut self) {
        self.maps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryType;
    use crate::notify::testing;
    use crate::options::Options;
    use crate::progress::Progress;
    use crate::render::layer::MemoryRaster;
    use crate::render::style::StyleName;
    use crate::store::memory::MemoryDriver;
    use crate::store::{FieldDefn, FieldType};
    use crate::tile::{tile_extent, Tile, VectorTile};

    fn registry() -> MapRegistry {
        MapRegistry::new(Settings::default(), StyleRegistry::new(), Arc::new(Notify::new()))
    }

    struct NoData;

    impl LayerResolver for NoData {
        fn feature_source(&self, _path: &Path, _name: &str) -> Option<Arc<dyn VectorTileSource>> {
            None
        }
    }

    struct FixedSource(PathBuf);

    impl VectorTileSource for FixedSource {
        fn get_tile(&self, _tile: &Tile, _extent: &Envelope) -> VectorTile {
            VectorTile::new()
        }

        fn geometry_type(&self) -> GeometryType {
            GeometryType::LineString
        }

        fn source_path(&self) -> Option<(PathBuf, String)> {
            Some((self.0.clone(), "roads".to_string()))
        }
    }

    struct FixedResolver {
        expected: PathBuf,
    }

    impl LayerResolver for FixedResolver {
        fn feature_source(&self, path: &Path, name: &str) -> Option<Arc<dyn VectorTileSource>> {
            (path == self.expected && name == "roads")
                .then(|| Arc::new(FixedSource(self.expected.clone())) as Arc<dyn VectorTileSource>)
        }
    }

    fn names(map: &Map) -> Vec<&str> {
        map.layers().iter().map(MapLayer::name).collect()
    }

    #[test]
    fn ids_start_at_one_and_reuse_free_slots() {
        let mut maps = registry();
        let a = maps.create_map("a", "", DEFAULT_EPSG, DEFAULT_BOUNDS);
        let b = maps.create_map("b", "", DEFAULT_EPSG, DEFAULT_BOUNDS);
        assert_eq!((a, b), (1, 2));
        assert!(maps.get_map(INVALID_MAP_ID).is_none());

        assert!(maps.close_map(a));
        assert!(!maps.close_map(a));
        assert_eq!(maps.create_map("c", "", DEFAULT_EPSG, DEFAULT_BOUNDS), 1);
        assert_eq!(maps.get_map(1).map(|m| m.name.as_str()), Some("c"));
    }

    #[test]
    fn registry_holds_at_most_255_maps() {
        let mut maps = registry();
        for _ in 0..255 {
            assert_ne!(maps.create_map("m", "", DEFAULT_EPSG, DEFAULT_BOUNDS), INVALID_MAP_ID);
        }
        assert_eq!(maps.create_map("overflow", "", DEFAULT_EPSG, DEFAULT_BOUNDS), INVALID_MAP_ID);
        assert!(maps.get_map(255).is_some());
        maps.clear();
        assert_eq!(maps.map_count(), 0);
    }

    #[test]
    fn create_map_notifies() {
        let notify = Arc::new(Notify::new());
        let events = testing::recorder(&notify);
        let mut maps = MapRegistry::new(Settings::default(), StyleRegistry::new(), notify);
        let id = maps.create_map("a", "", DEFAULT_EPSG, DEFAULT_BOUNDS);
        assert_eq!(events.lock().as_slice(), &[(id.to_string(), ChangeCode::CreateMap)]);
    }

    #[test]
    fn reorder_moves_before_target_or_to_end() {
        let mut map = Map::new("m", "", DEFAULT_EPSG, DEFAULT_BOUNDS, Settings::default());
        for name in ["a", "b", "c", "d"] {
            map.create_layer(name, LayerType::Vector);
        }
        assert!(map.reorder_layers(Some(1), 3));
        assert_eq!(names(&map), ["a", "d", "b", "c"]);
        assert!(map.reorder_layers(Some(3), 0));
        assert_eq!(names(&map), ["d", "b", "a", "c"]);
        assert!(map.reorder_layers(None, 0));
        assert_eq!(names(&map), ["b", "a", "c", "d"]);
        assert!(!map.reorder_layers(Some(9), 0));

        assert_eq!(map.delete_layer(1).map(|l| l.name().to_string()), Some("a".to_string()));
        assert_eq!(map.layer_count(), 3);
        assert!(map.delete_layer(5).is_none());
    }

    #[test]
    fn saved_map_reopens_with_relative_sources() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data.ngst");
        let map_path = dir.path().join("city.json");

        let mut maps = registry();
        let id = maps.create_map("city", "streets", 4326, Envelope::new(-1.0, -2.0, 3.0, 4.0));
        {
            let styles = StyleRegistry::new();
            let map = maps.get_map_mut(id).unwrap();
            map.background = Rgba::new(1, 2, 3, 4);
            map.create_feature_layer("roads", Arc::new(FixedSource(data.clone())), &styles);
        }
        maps.save_map(id, &map_path).unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&map_path).unwrap()).unwrap();
        assert_eq!(saved["layers"][0]["src"]["path"], json!("data.ngst"));
        assert_eq!(saved["bk_color"], json!("#01020304"));
        assert_eq!(saved["bounds"]["max_y"], json!(4.0));

        let reopened = maps
            .open_map(&map_path, &FixedResolver { expected: data })
            .unwrap();
        let map = maps.get_map(reopened).unwrap();
        assert_eq!((map.name.as_str(), map.description.as_str(), map.epsg), ("city", "streets", 4326));
        assert_eq!(map.bounds, Envelope::new(-1.0, -2.0, 3.0, 4.0));
        assert_eq!(map.background, Rgba::new(1, 2, 3, 4));
        let layer = map.layer(0).and_then(MapLayer::as_feature).unwrap();
        assert_eq!(layer.name(), "roads");
        assert!(layer.is_selectable());
        assert_eq!(layer.style().map(|s| s.name()), Some(StyleName::SimpleLine));
    }

    #[test]
    fn unresolved_layers_are_dropped() {
        let mut map = Map::new("m", "", DEFAULT_EPSG, DEFAULT_BOUNDS, Settings::default());
        let styles = StyleRegistry::new();
        map.create_feature_layer("roads", Arc::new(FixedSource(PathBuf::from("/data.ngst"))), &styles);
        let raster = MemoryRaster::new("dem", 2, 2, vec![vec![0; 4]], tile_extent(&Tile::new(0, 0, 1)));
        map.create_raster_layer("dem", Arc::new(raster));

        let saved = map.save(None);
        assert_eq!(saved["layers"].as_array().map(Vec::len), Some(2));
        let loaded = Map::load(&saved, None, &NoData, &styles, Settings::default()).unwrap();
        assert_eq!(loaded.layer_count(), 0);
        assert_eq!(loaded.name, "m");
    }

    #[test]
    fn dataset_resolver_finds_feature_classes() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Dataset::create(
            &dir.path().join("data.ngst"),
            Arc::new(MemoryDriver::database()),
            Settings::default().with_threads(2),
            Arc::new(Notify::new()),
        )
        .unwrap();
        dataset
            .create_feature_class(
                "roads",
                GeometryType::LineString,
                Some(3857),
                &[FieldDefn::new("name", FieldType::String)],
                &Options::new(),
                &Progress::default(),
            )
            .unwrap();

        let resolver = DatasetResolver::new(vec![dataset.clone()]);
        let source = resolver.feature_source(dataset.path(), "roads").unwrap();
        assert_eq!(source.geometry_type(), GeometryType::LineString);
        assert_eq!(
            source.source_path(),
            Some((dataset.path().to_path_buf(), "roads".to_string()))
        );
        assert!(resolver.feature_source(dataset.path(), "rivers").is_none());
    }
}
