use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    AttributeFilter, Cmp, FeatureStore, FieldDefn, FieldValue, Feature, LayerSchema, QueryResult,
    StoreDriver,
};
use crate::error::{GeoStoreError, Result};
use crate::options::Options;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryLayer {
    schema: LayerSchema,
    next_fid: i64,
    features: BTreeMap<i64, Feature>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    layers: Vec<MemoryLayer>,
    metadata: BTreeMap<String, BTreeMap<String, String>>,
}

impl StoreState {
    fn layer(&self, name: &str) -> Result<&MemoryLayer> {
        self.layers
            .iter()
            .find(|l| l.schema.name == name)
            .ok_or_else(|| GeoStoreError::Store(format!("Layer {} not found", name)))
    }

    fn layer_mut(&mut self, name: &str) -> Result<&mut MemoryLayer> {
        self.layers
            .iter_mut()
            .find(|l| l.schema.name == name)
            .ok_or_else(|| GeoStoreError::Store(format!("Layer {} not found", name)))
    }
}

/// In-memory feature store with optional JSON persistence.
///
/// A store with a path writes itself out on `flush`, on every mutation while
/// journaling is on, and when dropped with unsaved changes.
pub struct MemoryStore {
    path: Option<PathBuf>,
    read_only: bool,
    state: RwLock<StoreState>,
    dirty: AtomicBool,
    journal: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Unpersisted store, used for scratch data and query results.
    pub fn new() -> Self {
        Self {
            path: None,
            read_only: false,
            state: RwLock::new(StoreState::default()),
            dirty: AtomicBool::new(false),
            journal: AtomicBool::new(true),
        }
    }

    /// Create an empty store file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let store = Self {
            path: Some(path.to_path_buf()),
            read_only: false,
            state: RwLock::new(StoreState::default()),
            dirty: AtomicBool::new(false),
            journal: AtomicBool::new(true),
        };
        store.write_file()?;
        Ok(store)
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        if !read_only {
            let permissions = std::fs::metadata(path)?.permissions();
            if permissions.readonly() {
                return Err(GeoStoreError::Store(format!(
                    "Permission denied: {}",
                    path.display()
                )));
            }
        }
        let state: StoreState = serde_json::from_str(&text)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            read_only,
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
            journal: AtomicBool::new(true),
        })
    }

    /// Detached store holding one query result as its only layer.
    pub fn from_query_result(result: QueryResult) -> Self {
        let next_fid = result
            .features
            .iter()
            .filter_map(|f| f.fid)
            .max()
            .unwrap_or(0)
            + 1;
        let features = result
            .features
            .into_iter()
            .enumerate()
            .map(|(i, mut f)| {
                let fid = f.fid.unwrap_or(i as i64 + 1);
                f.fid = Some(fid);
                (fid, f)
            })
            .collect();
        let store = Self::new();
        store.state.write().layers.push(MemoryLayer {
            schema: result.schema,
            next_fid,
            features,
        });
        store
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(GeoStoreError::Store("read only".to_string()));
        }
        Ok(())
    }

    fn write_file(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = {
            let state = self.state.read();
            serde_json::to_string(&*state)?
        };
        std::fs::write(path, text)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn touched(&self) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        if self.journal.load(Ordering::SeqCst) {
            self.write_file()?;
        }
        Ok(())
    }

    fn conform(schema: &LayerSchema, feature: &mut Feature) {
        feature.fields.resize(schema.fields.len(), FieldValue::Null);
        if schema.geometry_type.is_none() {
            feature.geometry = None;
        }
    }

    fn select(&self, layer: &str, filter: Option<&AttributeFilter>) -> Result<QueryResult> {
        let state = self.state.read();
        let layer = state.layer(layer)?;
        let features = layer
            .features
            .values()
            .filter(|f| filter.map_or(true, |flt| flt.matches(&layer.schema, f)))
            .cloned()
            .collect();
        Ok(QueryResult {
            schema: layer.schema.clone(),
            features,
        })
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if self.dirty.load(Ordering::SeqCst) && !self.read_only {
            if let Err(err) = self.write_file() {
                warn!(error = %err, "failed to persist store on close");
            }
        }
    }
}

impl FeatureStore for MemoryStore {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn layer_names(&self) -> Vec<String> {
        self.state
            .read()
            .layers
            .iter()
            .map(|l| l.schema.name.clone())
            .collect()
    }

    fn layer_schema(&self, layer: &str) -> Option<LayerSchema> {
        self.state.read().layer(layer).ok().map(|l| l.schema.clone())
    }

    fn create_layer(&self, schema: &LayerSchema, _options: &Options) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            if state.layers.iter().any(|l| l.schema.name == schema.name) {
                return Err(GeoStoreError::Store(format!(
                    "Layer {} already exists",
                    schema.name
                )));
            }
            state.layers.push(MemoryLayer {
                schema: schema.clone(),
                next_fid: 1,
                features: BTreeMap::new(),
            });
        }
        self.touched()
    }

    fn delete_layer(&self, layer: &str) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            let index = state
                .layers
                .iter()
                .position(|l| l.schema.name == layer)
                .ok_or_else(|| GeoStoreError::Store(format!("Layer {} not found", layer)))?;
            state.layers.remove(index);
        }
        self.touched()
    }

    fn create_field(&self, layer: &str, field: &FieldDefn) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            let layer = state.layer_mut(layer)?;
            if layer.schema.field_index(&field.name).is_some() {
                return Err(GeoStoreError::Store(format!(
                    "Field {} already exists",
                    field.name
                )));
            }
            layer.schema.fields.push(field.clone());
            for feature in layer.features.values_mut() {
                feature.fields.push(FieldValue::Null);
            }
        }
        self.touched()
    }

    fn create_feature(&self, layer: &str, feature: &mut Feature) -> Result<i64> {
        self.check_writable()?;
        let fid = {
            let mut state = self.state.write();
            let layer = state.layer_mut(layer)?;
            let fid = match feature.fid {
                Some(fid) if layer.features.contains_key(&fid) => {
                    return Err(GeoStoreError::Store(format!(
                        "UNIQUE constraint failed: fid {}",
                        fid
                    )));
                }
                Some(fid) if fid > 0 => fid,
                _ => layer.next_fid,
            };
            layer.next_fid = layer.next_fid.max(fid + 1);
            feature.fid = Some(fid);
            let mut stored = feature.clone();
            Self::conform(&layer.schema, &mut stored);
            layer.features.insert(fid, stored);
            fid
        };
        self.touched()?;
        Ok(fid)
    }

    fn set_feature(&self, layer: &str, feature: &Feature) -> Result<()> {
        self.check_writable()?;
        let fid = feature
            .fid
            .ok_or_else(|| GeoStoreError::Store("Feature has no id".to_string()))?;
        {
            let mut state = self.state.write();
            let layer = state.layer_mut(layer)?;
            if !layer.features.contains_key(&fid) {
                return Err(GeoStoreError::Store(format!("Feature {} not found", fid)));
            }
            let mut stored = feature.clone();
            Self::conform(&layer.schema, &mut stored);
            layer.features.insert(fid, stored);
        }
        self.touched()
    }

    fn get_feature(&self, layer: &str, fid: i64) -> Option<Feature> {
        let state = self.state.read();
        state.layer(layer).ok()?.features.get(&fid).cloned()
    }

    fn delete_feature(&self, layer: &str, fid: i64) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            let layer = state.layer_mut(layer)?;
            if layer.features.remove(&fid).is_none() {
                return Err(GeoStoreError::Store(format!("Feature {} not found", fid)));
            }
        }
        self.touched()
    }

    fn features(&self, layer: &str, filter: Option<&AttributeFilter>) -> Result<Vec<Feature>> {
        Ok(self.select(layer, filter)?.features)
    }

    fn feature_count(&self, layer: &str) -> Result<u64> {
        Ok(self.state.read().layer(layer)?.features.len() as u64)
    }

    fn delete_where(&self, layer: &str, filter: Option<&AttributeFilter>) -> Result<usize> {
        self.check_writable()?;
        let removed = {
            let mut state = self.state.write();
            let layer = state.layer_mut(layer)?;
            let before = layer.features.len();
            let schema = layer.schema.clone();
            layer
                .features
                .retain(|_, f| !filter.map_or(true, |flt| flt.matches(&schema, f)));
            before - layer.features.len()
        };
        if removed > 0 {
            self.touched()?;
        }
        Ok(removed)
    }

    fn execute_sql(&self, statement: &str, dialect: &str) -> Result<Option<QueryResult>> {
        debug!(statement, dialect, "execute sql");
        match parse_statement(statement)? {
            Statement::Select { table, filter } => Ok(Some(self.select(&table, filter.as_ref())?)),
            Statement::Delete { table, filter } => {
                self.delete_where(&table, filter.as_ref())?;
                Ok(None)
            }
            Statement::NoOp => Ok(None),
        }
    }

    fn metadata_item(&self, domain: &str, key: &str) -> Option<String> {
        self.state
            .read()
            .metadata
            .get(domain)
            .and_then(|d| d.get(key))
            .cloned()
    }

    fn metadata(&self, domain: &str) -> BTreeMap<String, String> {
        self.state
            .read()
            .metadata
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    fn set_metadata_item(&self, domain: &str, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .metadata
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.touched()
    }

    fn clear_metadata(&self, domain: &str) -> Result<()> {
        self.check_writable()?;
        let removed = self.state.write().metadata.remove(domain).is_some();
        if removed {
            self.touched()?;
        }
        Ok(())
    }

    fn set_journal(&self, enabled: bool) -> Result<()> {
        self.journal.store(enabled, Ordering::SeqCst);
        if enabled {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.read_only || !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.write_file()
    }
}

#[derive(Debug, PartialEq)]
enum Statement {
    Select {
        table: String,
        filter: Option<AttributeFilter>,
    },
    Delete {
        table: String,
        filter: Option<AttributeFilter>,
    },
    NoOp,
}

// Find `keyword` as a whole word, ASCII case-insensitive.
fn find_keyword(haystack: &str, keyword: &str) -> Option<usize> {
    let upper = haystack.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let mut start = 0;
    while let Some(pos) = upper[start..].find(keyword) {
        let at = start + pos;
        let end = at + keyword.len();
        let before_ok = at == 0 || bytes[at - 1].is_ascii_whitespace();
        let after_ok = end == bytes.len() || bytes[end].is_ascii_whitespace();
        if before_ok && after_ok {
            return Some(at);
        }
        start = at + keyword.len();
    }
    None
}

fn split_and(clause: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = clause;
    while let Some(pos) = find_keyword(rest, "AND") {
        out.push(rest[..pos].trim());
        rest = &rest[pos + 3..];
    }
    out.push(rest.trim());
    out
}

fn parse_literal(text: &str) -> FieldValue {
    let text = text.trim();
    let quoted = |q: char| text.len() >= 2 && text.starts_with(q) && text.ends_with(q);
    if quoted('\'') || quoted('"') {
        return FieldValue::String(text[1..text.len() - 1].to_string());
    }
    if text.eq_ignore_ascii_case("NULL") {
        return FieldValue::Null;
    }
    if let Ok(v) = text.parse::<i64>() {
        return FieldValue::Integer(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return FieldValue::Real(v);
    }
    FieldValue::String(text.to_string())
}

fn parse_where(clause: &str) -> Result<AttributeFilter> {
    let mut filter = AttributeFilter::new();
    for part in split_and(clause) {
        let (field, cmp, value) = if let Some(pos) = find_keyword(part, "LIKE") {
            (&part[..pos], Cmp::Like, &part[pos + 4..])
        } else if let Some(pos) = part.find("<>") {
            (&part[..pos], Cmp::Ne, &part[pos + 2..])
        } else if let Some(pos) = part.find("!=") {
            (&part[..pos], Cmp::Ne, &part[pos + 2..])
        } else if let Some(pos) = part.find('=') {
            (&part[..pos], Cmp::Eq, &part[pos + 1..])
        } else {
            return Err(GeoStoreError::UnsupportedSql(format!(
                "condition '{}'",
                part
            )));
        };
        let field = field.trim().trim_matches('"');
        if field.is_empty() {
            return Err(GeoStoreError::UnsupportedSql(format!(
                "condition '{}'",
                part
            )));
        }
        filter = filter.and(field, cmp, parse_literal(value));
    }
    Ok(filter)
}

// Split "<table> [WHERE <cond>]"
fn parse_target(rest: &str) -> Result<(String, Option<AttributeFilter>)> {
    let (table, filter) = match find_keyword(rest, "WHERE") {
        Some(pos) => (&rest[..pos], Some(parse_where(&rest[pos + 5..])?)),
        None => (rest, None),
    };
    let table = table.trim().trim_matches('"').to_string();
    if table.is_empty() || table.contains(char::is_whitespace) {
        return Err(GeoStoreError::UnsupportedSql(format!("table name '{}'", table)));
    }
    Ok((table, filter))
}

/// Parse the SQL subset [`MemoryStore`] executes:
///
/// - `SELECT * FROM <table> [WHERE <cond> [AND <cond>]...]`
/// - `DELETE FROM <table> [WHERE <cond> [AND <cond>]...]`
/// - `PRAGMA ...`, `CREATE INDEX ...` and `DROP INDEX ...`, accepted as no-ops
///
/// A condition is `<field> = | <> | != | LIKE <literal>`, where the literal is
/// quoted text, `NULL` or a number. Keywords are case-insensitive and a
/// trailing `;` is ignored. Anything else is [`GeoStoreError::UnsupportedSql`].
fn parse_statement(statement: &str) -> Result<Statement> {
    let sql = statement.trim().trim_end_matches(';').trim();
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();

    match words.as_slice() {
        ["PRAGMA", ..] => Ok(Statement::NoOp),
        ["CREATE", "INDEX", ..] | ["DROP", "INDEX", ..] => Ok(Statement::NoOp),
        ["SELECT", "*", "FROM", ..] => {
            let from = find_keyword(sql, "FROM").unwrap_or(0);
            let (table, filter) = parse_target(&sql[from + 4..])?;
            Ok(Statement::Select { table, filter })
        }
        ["DELETE", "FROM", ..] => {
            let from = find_keyword(sql, "FROM").unwrap_or(0);
            let (table, filter) = parse_target(&sql[from + 4..])?;
            Ok(Statement::Delete { table, filter })
        }
        _ => Err(GeoStoreError::UnsupportedSql(sql.to_string())),
    }
}

/// Driver for [`MemoryStore`] files.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    database: bool,
    extension: String,
}

impl MemoryDriver {
    /// Single-file database format; auxiliary tables live in the same store.
    pub fn database() -> Self {
        Self {
            database: true,
            extension: "ngst".to_string(),
        }
    }

    /// Flat-file format; auxiliary tables go to a sibling additions store.
    pub fn flat_file() -> Self {
        Self {
            database: false,
            extension: "ngjson".to_string(),
        }
    }
}

impl StoreDriver for MemoryDriver {
    fn name(&self) -> &str {
        if self.database {
            "MemoryDB"
        } else {
            "MemoryFile"
        }
    }

    fn is_database(&self) -> bool {
        self.database
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn open(&self, path: &Path, read_only: bool) -> Result<Arc<dyn FeatureStore>> {
        Ok(Arc::new(MemoryStore::open(path, read_only)?))
    }

    fn create(&self, path: &Path) -> Result<Arc<dyn FeatureStore>> {
        Ok(Arc::new(MemoryStore::create(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FieldType, FID_FIELD};

    fn people() -> LayerSchema {
        LayerSchema::table(
            "people",
            vec![
                FieldDefn::new("id", FieldType::Integer),
                FieldDefn::new("name", FieldType::String),
            ],
        )
    }

    fn person(id: i64, name: &str) -> Feature {
        let mut f = Feature::new(2);
        f.set_field(0, id);
        f.set_field(1, name);
        f
    }

    #[test]
    fn crud_assigns_ids_from_one() {
        let store = MemoryStore::new();
        store.create_layer(&people(), &Options::new()).unwrap();

        let mut a = person(1, "a");
        let mut b = person(2, "b");
        assert_eq!(store.create_feature("people", &mut a).unwrap(), 1);
        assert_eq!(store.create_feature("people", &mut b).unwrap(), 2);
        assert_eq!(store.feature_count("people").unwrap(), 2);

        a.set_field(1, "aa");
        store.set_feature("people", &a).unwrap();
        assert_eq!(
            store.get_feature("people", 1).unwrap().field(1),
            &FieldValue::from("aa")
        );

        store.delete_feature("people", 1).unwrap();
        assert!(store.get_feature("people", 1).is_none());
        assert!(store.delete_feature("people", 1).is_err());
    }

    #[test]
    fn sql_subset() {
        let store = MemoryStore::new();
        store.create_layer(&people(), &Options::new()).unwrap();
        for (id, name) in [(1, "x"), (2, "y"), (2, "z")] {
            store.create_feature("people", &mut person(id, name)).unwrap();
        }

        let result = store
            .execute_sql("SELECT * FROM people WHERE id = 2 AND name <> 'y'", "")
            .unwrap()
            .unwrap();
        assert_eq!(result.features.len(), 1);
        assert_eq!(result.features[0].field(1), &FieldValue::from("z"));

        assert!(store
            .execute_sql("delete from people where name LIKE \"y%\";", "")
            .unwrap()
            .is_none());
        assert_eq!(store.feature_count("people").unwrap(), 2);

        assert!(store.execute_sql("PRAGMA synchronous = OFF", "").unwrap().is_none());
        assert!(store.execute_sql("CREATE INDEX IF NOT EXISTS i on people (id)", "").is_ok());
        assert!(matches!(
            store.execute_sql("UPDATE people SET id = 1", ""),
            Err(GeoStoreError::UnsupportedSql(sql)) if sql == "UPDATE people SET id = 1"
        ));
        assert!(matches!(
            store.execute_sql("SELECT * FROM people WHERE id > 1", ""),
            Err(GeoStoreError::UnsupportedSql(_))
        ));
        assert!(matches!(
            store.execute_sql("SELECT * FROM my people", ""),
            Err(GeoStoreError::UnsupportedSql(_))
        ));

        let by_fid = store
            .features("people", Some(&AttributeFilter::eq(FID_FIELD, 3)))
            .unwrap();
        assert_eq!(by_fid.len(), 1);
    }

    #[test]
    fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.ngst");
        {
            let store = MemoryStore::create(&path).unwrap();
            store.create_layer(&people(), &Options::new()).unwrap();
            store.set_journal(false).unwrap();
            store.create_feature("people", &mut person(5, "p")).unwrap();
            store.set_metadata_item("nga", "version", "1").unwrap();
            store.set_journal(true).unwrap();
        }

        let reopened = MemoryStore::open(&path, true).unwrap();
        assert_eq!(reopened.layer_names(), vec!["people".to_string()]);
        assert_eq!(reopened.feature_count("people").unwrap(), 1);
        assert_eq!(reopened.metadata_item("nga", "version").as_deref(), Some("1"));
        assert!(reopened
            .create_feature("people", &mut person(6, "q"))
            .is_err());
    }

    #[test]
    fn table_layers_drop_geometry() {
        let store = MemoryStore::new();
        store.create_layer(&people(), &Options::new()).unwrap();
        let mut f = person(1, "a");
        f.geometry = Some(geo_types::point!(x: 1.0, y: 1.0).into());
        store.create_feature("people", &mut f).unwrap();
        assert!(store.get_feature("people", 1).unwrap().geometry.is_none());
    }
}
