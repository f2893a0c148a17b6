use lazy_static::lazy_static;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{GeoStoreError, Result, ResultCode};
use crate::feature_class::FeatureClass;
use crate::geometry::GeometryType;
use crate::notify::{ChangeCode, Notify};
use crate::options::{self, Options};
use crate::progress::Progress;
use crate::store::{
    reset_extension, AttributeFilter, Feature, FeatureStore, FieldDefn, FieldType, LayerSchema,
    MemoryStore, StoreDriver,
};
use crate::table::{
    remove_dir_if_exists, Table, ATTACH_DESCRIPTION_FIELD, ATTACH_FEATURE_ID_FIELD,
    ATTACH_FILE_NAME_FIELD, FEATURE_ID_FIELD, OPERATION_FIELD,
};

/// Property domain of the library's own settings.
pub const NG_ADDITIONS_KEY: &str = "nga";
pub const METADATA_TABLE_NAME: &str = "nga_meta";
pub const ADDITIONS_EXTENSION: &str = "ngadds";
pub const ATTACHMENTS_EXTENSION: &str = "attachments";
pub const MAX_EQUAL_NAMES: u32 = 10000;

const HIDDEN_PREFIX: &str = "nga_";
const META_KEY_FIELD: &str = "key";
const META_VALUE_FIELD: &str = "value";
const META_KEY_WIDTH: u32 = 128;
const META_VALUE_WIDTH: u32 = 512;
const METADATA_VERSION: &str = "1";

const FORBIDDEN_CHARS: [char; 22] = [
    ':', '@', '#', '%', '^', '&', '*', '!', '$', '(', ')', '+', '-', '?', '=', '/', '\\', '"',
    '\'', '[', ']', ',',
];

lazy_static! {
    static ref RESERVED_WORDS: HashSet<&'static str> = [
        "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ANALYZE", "AND", "AS", "ASC",
        "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE",
        "CAST", "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE",
        "CROSS", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT",
        "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DROP", "EACH",
        "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL", "FOR",
        "FOREIGN", "FROM", "FULL", "GLOB", "GROUP", "HAVING", "IF", "IGNORE", "IMMEDIATE",
        "IN", "INDEX", "INDEXED", "INITIALLY", "INNER", "INSERT", "INSTEAD", "INTERSECT",
        "INTO", "IS", "ISNULL", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "MATCH", "NATURAL",
        "NO", "NOT", "NOTNULL", "NULL", "OF", "OFFSET", "ON", "OR", "ORDER", "OUTER", "PLAN",
        "PRAGMA", "PRIMARY", "QUERY", "RAISE", "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX",
        "RELEASE", "RENAME", "REPLACE", "RESTRICT", "RIGHT", "ROLLBACK", "ROW", "SAVEPOINT",
        "SELECT", "SET", "TABLE", "TEMP", "TEMPORARY", "THEN", "TO", "TRANSACTION", "TRIGGER",
        "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL", "WHEN",
        "WHERE", "WITH", "WITHOUT",
    ]
    .into_iter()
    .collect();
}

/// Side table of one kind kept next to a user table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuxKind {
    Overviews,
    Attachments,
    EditHistory,
}

impl AuxKind {
    fn table_name(self, table: &str) -> String {
        let suffix = match self {
            AuxKind::Overviews => "overviews",
            AuxKind::Attachments => "attachments",
            AuxKind::EditHistory => "editlog",
        };
        format!("{}{}_{}", HIDDEN_PREFIX, table, suffix)
    }

    fn fields(self) -> Vec<FieldDefn> {
        match self {
            AuxKind::Overviews => vec![
                FieldDefn::new("x", FieldType::Integer),
                FieldDefn::new("y", FieldType::Integer),
                FieldDefn::new("z", FieldType::Integer),
                FieldDefn::new("tile", FieldType::Binary),
            ],
            AuxKind::Attachments => vec![
                FieldDefn::new(ATTACH_FEATURE_ID_FIELD, FieldType::Integer64),
                FieldDefn::new(ATTACH_FILE_NAME_FIELD, FieldType::String),
                FieldDefn::new(ATTACH_DESCRIPTION_FIELD, FieldType::String),
            ],
            AuxKind::EditHistory => vec![
                FieldDefn::new(FEATURE_ID_FIELD, FieldType::Integer64),
                FieldDefn::new(ATTACH_FEATURE_ID_FIELD, FieldType::Integer64),
                FieldDefn::new(OPERATION_FIELD, FieldType::Integer64),
            ],
        }
    }
}

/// Handle to a hidden table in the additions store.
///
/// Callers hold the dataset SQL lock around row access.
#[derive(Clone)]
pub struct AuxTable {
    store: Arc<dyn FeatureStore>,
    name: String,
}

impl std::fmt::Debug for AuxTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxTable").field("name", &self.name).finish()
    }
}

impl AuxTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_row(&self) -> Feature {
        let count = self
            .store
            .layer_schema(&self.name)
            .map_or(0, |s| s.fields.len());
        Feature::new(count)
    }

    pub fn create(&self, feature: &mut Feature) -> Result<i64> {
        self.store.create_feature(&self.name, feature)
    }

    pub fn set(&self, feature: &Feature) -> Result<()> {
        self.store.set_feature(&self.name, feature)
    }

    pub fn get(&self, fid: i64) -> Option<Feature> {
        self.store.get_feature(&self.name, fid)
    }

    pub fn delete(&self, fid: i64) -> Result<()> {
        self.store.delete_feature(&self.name, fid)
    }

    pub fn features(&self, filter: Option<&AttributeFilter>) -> Result<Vec<Feature>> {
        self.store.features(&self.name, filter)
    }

    pub fn delete_where(&self, filter: Option<&AttributeFilter>) -> Result<usize> {
        self.store.delete_where(&self.name, filter)
    }

    pub fn count(&self) -> u64 {
        self.store.feature_count(&self.name).unwrap_or(0)
    }
}

/// A dataset child: plain table or feature class.
#[derive(Clone, Debug)]
pub enum ChildRef {
    Table(Arc<Table>),
    FeatureClass(Arc<FeatureClass>),
}

impl ChildRef {
    pub fn name(&self) -> &str {
        self.table().name()
    }

    pub fn table(&self) -> &Table {
        match self {
            ChildRef::Table(table) => table,
            ChildRef::FeatureClass(fc) => fc.table(),
        }
    }

    pub fn as_table(&self) -> Option<&Arc<Table>> {
        match self {
            ChildRef::Table(table) => Some(table),
            ChildRef::FeatureClass(_) => None,
        }
    }

    pub fn as_feature_class(&self) -> Option<&Arc<FeatureClass>> {
        match self {
            ChildRef::FeatureClass(fc) => Some(fc),
            ChildRef::Table(_) => None,
        }
    }

    /// Same underlying object.
    pub fn ptr_eq(&self, other: &ChildRef) -> bool {
        match (self, other) {
            (ChildRef::Table(a), ChildRef::Table(b)) => Arc::ptr_eq(a, b),
            (ChildRef::FeatureClass(a), ChildRef::FeatureClass(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn insert_feature(&self, feature: &mut Feature, log_edits: bool) -> Result<()> {
        match self {
            ChildRef::Table(table) => table.insert_feature(feature, log_edits),
            ChildRef::FeatureClass(fc) => fc.insert_feature(feature, log_edits),
        }
    }

    pub fn update_feature(&self, feature: &Feature, log_edits: bool) -> Result<()> {
        match self {
            ChildRef::Table(table) => table.update_feature(feature, log_edits),
            ChildRef::FeatureClass(fc) => fc.update_feature(feature, log_edits),
        }
    }

    pub fn delete_feature(&self, fid: i64, log_edits: bool) -> Result<()> {
        match self {
            ChildRef::Table(table) => table.delete_feature(fid, log_edits),
            ChildRef::FeatureClass(fc) => fc.delete_feature(fid, log_edits),
        }
    }

    pub fn delete_features(&self, log_edits: bool) -> Result<()> {
        match self {
            ChildRef::Table(table) => table.delete_features(log_edits),
            ChildRef::FeatureClass(fc) => fc.delete_features(log_edits),
        }
    }

    pub fn destroy(&self) -> Result<()> {
        match self {
            ChildRef::Table(table) => table.destroy(),
            ChildRef::FeatureClass(fc) => fc.destroy(),
        }
    }
}

/// Held while the dataset SQL lock is taken.
pub struct SqlLockGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

/// Keeps a batch operation open until dropped.
pub struct BatchOperationGuard {
    dataset: Weak<Dataset>,
}

impl Drop for BatchOperationGuard {
    fn drop(&mut self) {
        if let Some(dataset) = self.dataset.upgrade() {
            dataset.stop_batch_operation();
        }
    }
}

/// A container file with its tables, feature classes and hidden side tables.
pub struct Dataset {
    self_ref: Weak<Dataset>,
    path: PathBuf,
    driver: Arc<dyn StoreDriver>,
    settings: Settings,
    notify: Arc<Notify>,
    read_only: AtomicBool,
    store: RwLock<Option<Arc<dyn FeatureStore>>>,
    adds: RwLock<Option<Arc<dyn FeatureStore>>>,
    children: RwLock<Vec<ChildRef>>,
    children_loaded: AtomicBool,
    sql_lock: ReentrantMutex<()>,
    batch: Mutex<u32>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("path", &self.path)
            .field("driver", &self.driver.name())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl Dataset {
    fn new_handle(
        path: &Path,
        driver: Arc<dyn StoreDriver>,
        settings: Settings,
        notify: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            path: path.to_path_buf(),
            driver,
            settings,
            notify,
            read_only: AtomicBool::new(false),
            store: RwLock::new(None),
            adds: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            children_loaded: AtomicBool::new(false),
            sql_lock: ReentrantMutex::new(()),
            batch: Mutex::new(0),
        })
    }

    /// Create a new empty container at `path`.
    pub fn create(
        path: &Path,
        driver: Arc<dyn StoreDriver>,
        settings: Settings,
        notify: Arc<Notify>,
    ) -> Result<Arc<Self>> {
        let dataset = Self::new_handle(path, driver, settings, notify);
        let store = dataset.driver.create(path)?;
        if dataset.driver.is_database() {
            *dataset.adds.write() = Some(Arc::clone(&store));
        }
        *dataset.store.write() = Some(store);
        dataset.children_loaded.store(true, Ordering::SeqCst);
        info!(path = %path.display(), driver = dataset.driver.name(), "dataset created");
        Ok(dataset)
    }

    /// Open an existing container. A writable open that the store refuses
    /// falls back to read-only.
    pub fn open(
        path: &Path,
        driver: Arc<dyn StoreDriver>,
        settings: Settings,
        notify: Arc<Notify>,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        let dataset = Self::new_handle(path, driver, settings, notify);
        dataset.open_stores(read_only)?;
        dataset.load_children();
        Ok(dataset)
    }

    fn open_stores(&self, read_only: bool) -> Result<()> {
        let (store, read_only) = if read_only {
            (self.driver.open(&self.path, true)?, true)
        } else {
            match self.driver.open(&self.path, false) {
                Ok(store) => (store, false),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "open for update failed, trying read only");
                    (self.driver.open(&self.path, true)?, true)
                }
            }
        };
        self.read_only.store(read_only, Ordering::SeqCst);

        let adds = if self.driver.is_database() {
            Some(Arc::clone(&store))
        } else {
            let adds_path = reset_extension(&self.path, ADDITIONS_EXTENSION);
            if adds_path.exists() {
                match self.driver.open(&adds_path, read_only) {
                    Ok(adds) => Some(adds),
                    Err(err) => {
                        warn!(path = %adds_path.display(), error = %err, "additions store not opened");
                        None
                    }
                }
            } else {
                None
            }
        };
        *self.store.write() = Some(store);
        *self.adds.write() = adds;
        debug!(path = %self.path.display(), read_only, "dataset opened");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn driver(&self) -> &Arc<dyn StoreDriver> {
        &self.driver
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn notifier(&self) -> &Arc<Notify> {
        &self.notify
    }

    pub fn is_opened(&self) -> bool {
        self.store.read().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn is_database(&self) -> bool {
        self.driver.is_database()
    }

    pub fn can_create(&self) -> bool {
        self.is_opened() && !self.is_read_only()
    }

    pub fn can_paste(&self) -> bool {
        self.can_create()
    }

    pub fn store(&self) -> Result<Arc<dyn FeatureStore>> {
        self.store.read().clone().ok_or(GeoStoreError::NotOpened)
    }

    fn adds_store(&self) -> Option<Arc<dyn FeatureStore>> {
        self.adds.read().clone()
    }

    /// Wait for the SQL lock, up to the configured timeout.
    pub fn lock_execute_sql(&self) -> Result<SqlLockGuard<'_>> {
        self.sql_lock
            .try_lock_for(self.settings.sql_lock_timeout())
            .map(|guard| SqlLockGuard { _guard: guard })
            .ok_or_else(|| {
                warn!(path = %self.path.display(), "sql lock wait timed out");
                GeoStoreError::Timeout
            })
    }

    /// Run `statement` on the primary store. Row results come back as a
    /// detached query-result child.
    pub fn execute_sql(&self, statement: &str, dialect: &str) -> Result<Option<ChildRef>> {
        let store = self.store()?;
        let result = {
            let _guard = self.lock_execute_sql()?;
            store.execute_sql(statement, dialect)?
        };
        let Some(result) = result else {
            return Ok(None);
        };
        let name = result.schema.name.clone();
        let geometry_type = result.schema.geometry_type;
        let srs = result.schema.srs;
        let detached: Arc<dyn FeatureStore> = Arc::new(MemoryStore::from_query_result(result));
        let table = Table::detached(name, detached);
        Ok(Some(match geometry_type {
            Some(ty) => ChildRef::FeatureClass(Arc::new(FeatureClass::new(table, ty, srs))),
            None => ChildRef::Table(Arc::new(table)),
        }))
    }

    // Batch operations

    pub fn is_batch_operation(&self) -> bool {
        *self.batch.lock() > 0
    }

    /// Enter a (possibly nested) batch. The outermost one disables the
    /// store journal.
    pub fn start_batch_operation(&self) {
        let mut counter = self.batch.lock();
        if *counter == 0 {
            self.set_journal(false);
        }
        *counter += 1;
    }

    /// Leave a batch. The outermost one restores the journal and emits one
    /// change notification for the whole dataset.
    pub fn stop_batch_operation(&self) {
        let finished = {
            let mut counter = self.batch.lock();
            if *counter == 0 {
                return;
            }
            *counter -= 1;
            if *counter == 0 {
                self.set_journal(true);
            }
            *counter == 0
        };
        if finished {
            self.notify
                .notify(&self.path.display().to_string(), ChangeCode::ChangeObject);
        }
    }

    pub fn batch_guard(&self) -> BatchOperationGuard {
        self.start_batch_operation();
        BatchOperationGuard {
            dataset: self.self_ref.clone(),
        }
    }

    fn set_journal(&self, enabled: bool) {
        let store = self.store.read().clone();
        let adds = self.adds_store();
        for store in store.iter().chain(adds.iter()) {
            if let Err(err) = store.set_journal(enabled) {
                debug!(enabled, error = %err, "journal switch failed");
            }
        }
    }

    // Children

    fn is_hidden_layer(name: &str) -> bool {
        name.eq_ignore_ascii_case(METADATA_TABLE_NAME)
            || name.to_ascii_lowercase().starts_with(HIDDEN_PREFIX)
    }

    fn make_child(&self, schema: &LayerSchema) -> ChildRef {
        let table = Table::new(schema.name.clone(), self.self_ref.clone());
        match schema.geometry_type {
            Some(ty) => ChildRef::FeatureClass(Arc::new(FeatureClass::new(table, ty, schema.srs))),
            None => ChildRef::Table(Arc::new(table)),
        }
    }

    fn visible_schemas(&self) -> Vec<LayerSchema> {
        let Ok(store) = self.store() else {
            return Vec::new();
        };
        store
            .layer_names()
            .into_iter()
            .filter(|name| !Self::is_hidden_layer(name))
            .filter_map(|name| store.layer_schema(&name))
            .collect()
    }

    fn load_children(&self) {
        let children: Vec<ChildRef> = self
            .visible_schemas()
            .iter()
            .map(|schema| self.make_child(schema))
            .collect();
        *self.children.write() = children;
        self.children_loaded.store(true, Ordering::SeqCst);
    }

    pub fn children(&self) -> Vec<ChildRef> {
        if !self.children_loaded.load(Ordering::SeqCst) {
            self.load_children();
        }
        self.children.read().clone()
    }

    pub fn get_child(&self, name: &str) -> Option<ChildRef> {
        self.children()
            .into_iter()
            .find(|child| child.name().eq_ignore_ascii_case(name))
    }

    /// Re-sync children with the store, keeping the objects of layers that
    /// still exist.
    pub fn refresh(&self) {
        if !self.children_loaded.load(Ordering::SeqCst) {
            self.load_children();
            return;
        }
        let schemas = self.visible_schemas();
        let mut children = self.children.write();
        children.retain(|child| schemas.iter().any(|s| s.name == child.name()));
        for schema in &schemas {
            if !children.iter().any(|child| child.name() == schema.name) {
                children.push(self.make_child(schema));
            }
        }
    }

    fn push_child(&self, child: ChildRef) {
        self.children.write().push(child);
    }

    // Creation

    fn check_can_create(&self) -> Result<()> {
        if !self.is_opened() {
            return Err(GeoStoreError::NotOpened);
        }
        if self.is_read_only() {
            return Err(GeoStoreError::ReadOnly);
        }
        Ok(())
    }

    /// Create the layer with normalised field names. Returns the renamed
    /// fields as `(index, original name)`.
    fn create_layer(
        &self,
        name: &str,
        geometry_type: Option<GeometryType>,
        srs: Option<u32>,
        fields: &[FieldDefn],
        options: &Options,
        progress: &Progress,
    ) -> Result<Vec<(usize, String)>> {
        self.check_can_create()?;
        let mut renamed = Vec::new();
        let normalized: Vec<FieldDefn> = fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let new_name = self.normalize_field_name(&field.name);
                if new_name != field.name {
                    progress.on_progress(
                        ResultCode::Warning,
                        0.0,
                        &format!(
                            "Field {} of source table was renamed to {} in destination table",
                            field.name, new_name
                        ),
                    );
                    renamed.push((i, field.name.clone()));
                }
                FieldDefn {
                    name: new_name,
                    ..field.clone()
                }
            })
            .collect();
        let schema = match geometry_type {
            Some(ty) => LayerSchema::feature_class(name, ty, srs, normalized),
            None => LayerSchema::table(name, normalized),
        };
        let store = self.store()?;
        {
            let _guard = self.lock_execute_sql()?;
            store.create_layer(&schema, options)?;
        }
        Ok(renamed)
    }

    fn record_original_names(table: &Table, renamed: &[(usize, String)]) {
        for (index, original) in renamed {
            let key = format!("FIELD_{}_NAME", index);
            if let Err(err) = table.set_property(&key, original, NG_ADDITIONS_KEY) {
                debug!(table = %table.name(), error = %err, "original field name not saved");
            }
        }
    }

    pub fn create_table(
        &self,
        name: &str,
        fields: &[FieldDefn],
        options: &Options,
        progress: &Progress,
    ) -> Result<Arc<Table>> {
        let renamed = self.create_layer(name, None, None, fields, options, progress)?;
        let table = Arc::new(Table::new(name, self.self_ref.clone()));
        self.push_child(ChildRef::Table(Arc::clone(&table)));
        Self::record_original_names(&table, &renamed);
        self.notify.notify(&table.full_name(), ChangeCode::CreateObject);
        Ok(table)
    }

    /// Create a feature class. Overviews are built right away when
    /// `CREATE_OVERVIEWS` and `ZOOM_LEVELS` are set.
    pub fn create_feature_class(
        &self,
        name: &str,
        geometry_type: GeometryType,
        srs: Option<u32>,
        fields: &[FieldDefn],
        options: &Options,
        progress: &Progress,
    ) -> Result<Arc<FeatureClass>> {
        let renamed =
            self.create_layer(name, Some(geometry_type), srs, fields, options, progress)?;
        let table = Table::new(name, self.self_ref.clone());
        let fc = Arc::new(FeatureClass::new(table, geometry_type, srs));
        self.push_child(ChildRef::FeatureClass(Arc::clone(&fc)));
        Self::record_original_names(&fc, &renamed);

        if options.as_bool(options::CREATE_OVERVIEWS, false)
            && !options.as_string(options::ZOOM_LEVELS, "").is_empty()
        {
            fc.create_overviews(progress, options)?;
        }
        self.notify.notify(&fc.full_name(), ChangeCode::CreateObject);
        Ok(fc)
    }

    /// Copy (or move, with `MOVE`) `source` into this dataset.
    pub fn paste(&self, source: &ChildRef, options: &Options, progress: &Progress) -> Result<()> {
        let moving = options.as_bool(options::MOVE, false);
        if !self.can_paste() {
            let err = GeoStoreError::copy_or_move(moving, "Destination is not writable");
            progress.on_progress(err.code(), 0.0, &err.to_string());
            return Err(err);
        }

        let requested = match options.get(options::NEW_NAME) {
            Some(name) => name.to_string(),
            None => Path::new(source.name())
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let new_name = self.normalize_dataset_name(&requested)?;
        let verb = if moving { "Move" } else { "Copy" };
        progress.on_progress(
            ResultCode::InProcess,
            0.0,
            &format!("{} '{}' to '{}'", verb, source.name(), new_name),
        );

        // Overviews are built after the rows are in
        let mut create_options = options.clone();
        create_options.remove(options::CREATE_OVERVIEWS);

        let created = match source {
            ChildRef::Table(src) => {
                let fields: Vec<FieldDefn> =
                    src.schema().map(|s| s.fields).unwrap_or_default();
                let dst = self
                    .create_table(&new_name, &fields, &create_options, progress)
                    .map_err(|err| GeoStoreError::copy_or_move(moving, err.to_string()))?;
                let field_map = positional_field_map(&new_name, fields.len(), dst.fields().len());
                dst.copy_rows(src, &field_map, progress)?;
                vec![dst.full_name()]
            }
            ChildRef::FeatureClass(src) => {
                self.paste_feature_class(src, &new_name, moving, options, &create_options, progress)?
            }
        };

        let Some(last) = created.last() else {
            let err = GeoStoreError::Unsupported(source.name().to_string());
            progress.on_progress(err.code(), 0.0, &err.to_string());
            return Err(err);
        };
        self.notify.notify(last, ChangeCode::CreateObject);

        if moving {
            source.destroy().map_err(|err| {
                progress.on_progress(ResultCode::DeleteFailed, 1.0, &err.to_string());
                GeoStoreError::DeleteFailed(err.to_string())
            })?;
        }
        info!(source = %source.name(), name = %new_name, moving, "pasted");
        Ok(())
    }

    fn paste_feature_class(
        &self,
        src: &FeatureClass,
        new_name: &str,
        moving: bool,
        options: &Options,
        create_options: &Options,
        progress: &Progress,
    ) -> Result<Vec<String>> {
        let zoom_levels = options.as_string(options::ZOOM_LEVELS, "");
        let create_overviews =
            options.as_bool(options::CREATE_OVERVIEWS, false) && !zoom_levels.is_empty();
        let to_multi = options.as_bool(options::FORCE_GEOMETRY_TO_MULTI, false);
        let filter = options
            .get(options::ACCEPT_GEOMETRY)
            .and_then(GeometryType::from_name)
            .filter(|ty| *ty != GeometryType::Unknown);

        let fields: Vec<FieldDefn> = src.schema().map(|s| s.fields).unwrap_or_default();
        let types = src.geometry_types();
        let split = types.len() > 1 && filter.is_none();

        let mut step_progress = progress.clone();
        if create_overviews {
            step_progress.set_total_steps(2);
        }

        let mut created = Vec::new();
        for ty in types {
            if filter.map_or(false, |f| f.to_multi() != ty.to_multi()) {
                continue;
            }
            let name = if split {
                self.normalize_dataset_name(&format!("{}_{}", new_name, ty.simple_name()))?
            } else {
                new_name.to_string()
            };
            let dst_type = if to_multi || filter.map_or(false, |f| !f.is_single()) {
                ty.to_multi()
            } else {
                ty
            };
            let dst = self
                .create_feature_class(&name, dst_type, src.srs(), &fields, create_options, progress)
                .map_err(|err| GeoStoreError::copy_or_move(moving, err.to_string()))?;
            let field_map = positional_field_map(&name, fields.len(), dst.fields().len());

            step_progress.set_step(0);
            // Each destination only takes its own family
            dst.copy_features(src, &field_map, Some(dst_type), &step_progress, options)?;
            if create_overviews {
                step_progress.set_step(1);
                dst.create_overviews(
                    &step_progress,
                    &options.clone().with(options::FORCE, "ON"),
                )?;
            }
            created.push(dst.full_name());
        }
        Ok(created)
    }

    // Names

    /// Unique, store-safe name for a new child.
    pub fn normalize_dataset_name(&self, name: &str) -> Result<String> {
        self.unique_name(name, MAX_EQUAL_NAMES)
    }

    fn unique_name(&self, name: &str, max_equal: u32) -> Result<String> {
        let cleaned = replace_forbidden_chars(&strip_non_ascii(name));
        let base = if cleaned.is_empty() {
            "new_dataset".to_string()
        } else {
            cleaned
        };
        let mut out = base.clone();
        let mut counter = 0;
        while !self.is_name_valid(&out) {
            counter += 1;
            if counter == max_equal {
                return Err(GeoStoreError::InvalidName(name.to_string()));
            }
            out = format!("{}_{}", base, counter);
        }
        Ok(out)
    }

    /// Field name safe for this store. Not checked for uniqueness.
    pub fn normalize_field_name(&self, name: &str) -> String {
        let mut out = replace_forbidden_chars(&strip_non_ascii(name));
        if out.starts_with(|c: char| c.is_ascii_digit()) {
            out = format!("Fld_{}", out);
        }
        if self.is_database() && RESERVED_WORDS.contains(out.to_ascii_uppercase().as_str()) {
            out.push('_');
        }
        out
    }

    pub fn is_name_valid(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if self.is_database() && name.eq_ignore_ascii_case(METADATA_TABLE_NAME) {
            return false;
        }
        !self
            .children()
            .iter()
            .any(|child| child.name().eq_ignore_ascii_case(name))
    }

    // Hidden tables

    pub fn attachments_folder(&self) -> PathBuf {
        reset_extension(&self.path, ATTACHMENTS_EXTENSION)
    }

    fn create_additions_store(&self) -> Result<Arc<dyn FeatureStore>> {
        if let Some(adds) = self.adds_store() {
            return Ok(adds);
        }
        let adds = if self.is_database() {
            self.store()?
        } else {
            let adds_path = reset_extension(&self.path, ADDITIONS_EXTENSION);
            debug!(path = %adds_path.display(), "creating additions store");
            self.driver.create(&adds_path)?
        };
        if self.is_batch_operation() {
            adds.set_journal(false)?;
        }
        *self.adds.write() = Some(Arc::clone(&adds));
        Ok(adds)
    }

    fn get_aux_table(&self, kind: AuxKind, table: &str) -> Option<AuxTable> {
        let store = self.adds_store()?;
        let name = kind.table_name(table);
        store.has_layer(&name).then(|| AuxTable { store, name })
    }

    fn create_aux_table(&self, kind: AuxKind, table: &str) -> Result<AuxTable> {
        if self.is_read_only() {
            return Err(GeoStoreError::ReadOnly);
        }
        let _guard = self.lock_execute_sql()?;
        let store = self.create_additions_store()?;
        let name = kind.table_name(table);
        if !store.has_layer(&name) {
            store.create_layer(&LayerSchema::table(name.clone(), kind.fields()), &Options::new())?;
        }
        Ok(AuxTable { store, name })
    }

    fn destroy_aux_table(&self, kind: AuxKind, table: &str) -> Result<()> {
        let store = self
            .adds_store()
            .ok_or_else(|| GeoStoreError::NotFound(kind.table_name(table)))?;
        let _guard = self.lock_execute_sql()?;
        store.delete_layer(&kind.table_name(table))
    }

    pub fn get_overviews_table(&self, table: &str) -> Option<AuxTable> {
        self.get_aux_table(AuxKind::Overviews, table)
    }

    pub fn create_overviews_table(&self, table: &str) -> Result<AuxTable> {
        self.create_aux_table(AuxKind::Overviews, table)
    }

    pub fn destroy_overviews_table(&self, table: &str) -> Result<()> {
        self.destroy_aux_table(AuxKind::Overviews, table)
    }

    pub fn clear_overviews_table(&self, table: &str) -> Result<()> {
        self.delete_features(&AuxKind::Overviews.table_name(table))
    }

    pub fn get_attachments_table(&self, table: &str) -> Option<AuxTable> {
        self.get_aux_table(AuxKind::Attachments, table)
    }

    pub fn create_attachments_table(&self, table: &str) -> Result<AuxTable> {
        self.create_aux_table(AuxKind::Attachments, table)
    }

    pub fn destroy_attachments_table(&self, table: &str) -> Result<()> {
        self.destroy_aux_table(AuxKind::Attachments, table)
    }

    pub fn get_edit_history_table(&self, table: &str) -> Option<AuxTable> {
        self.get_aux_table(AuxKind::EditHistory, table)
    }

    pub fn create_edit_history_table(&self, table: &str) -> Result<AuxTable> {
        self.create_aux_table(AuxKind::EditHistory, table)
    }

    pub fn destroy_edit_history_table(&self, table: &str) -> Result<()> {
        self.destroy_aux_table(AuxKind::EditHistory, table)
    }

    pub fn clear_edit_history_table(&self, table: &str) -> Result<()> {
        self.delete_features(&AuxKind::EditHistory.table_name(table))
    }

    /// Remove every row of layer `name`, looked up in the primary store
    /// first and then in the additions store. Emits no notification.
    pub fn delete_features(&self, name: &str) -> Result<()> {
        let store = self.store()?;
        let store = if store.has_layer(name) {
            store
        } else {
            self.adds_store()
                .filter(|adds| adds.has_layer(name))
                .ok_or_else(|| GeoStoreError::NotFound(name.to_string()))?
        };
        let _guard = self.lock_execute_sql()?;
        let removed = store.delete_where(name, None)?;
        debug!(layer = name, removed, "rows deleted");
        Ok(())
    }

    /// Drop layer `name` with its properties and forget the child.
    pub fn destroy_table(&self, name: &str) -> Result<()> {
        let store = self.store()?;
        {
            let _guard = self.lock_execute_sql()?;
            store.delete_layer(name)?;
        }
        if let Err(err) = self.delete_properties(name) {
            debug!(layer = name, error = %err, "properties not removed");
        }
        self.children.write().retain(|child| child.name() != name);
        Ok(())
    }

    // Properties

    fn metadata_table(&self) -> Option<AuxTable> {
        let store = self.adds_store()?;
        store.has_layer(METADATA_TABLE_NAME).then(|| AuxTable {
            store,
            name: METADATA_TABLE_NAME.to_string(),
        })
    }

    fn create_metadata_table(&self, store: &Arc<dyn FeatureStore>) -> Result<AuxTable> {
        let table = AuxTable {
            store: Arc::clone(store),
            name: METADATA_TABLE_NAME.to_string(),
        };
        if store.has_layer(METADATA_TABLE_NAME) {
            return Ok(table);
        }
        let schema = LayerSchema::table(
            METADATA_TABLE_NAME,
            vec![
                FieldDefn::new(META_KEY_FIELD, FieldType::String).with_width(META_KEY_WIDTH),
                FieldDefn::new(META_VALUE_FIELD, FieldType::String).with_width(META_VALUE_WIDTH),
            ],
        );
        store.create_layer(&schema, &Options::new())?;
        let mut row = table.create_row();
        row.set_field(0, "version");
        row.set_field(1, METADATA_VERSION);
        table.create(&mut row)?;
        Ok(table)
    }

    fn meta_rows_with_prefix(table: &AuxTable, prefix: &str) -> Vec<Feature> {
        table
            .features(None)
            .unwrap_or_default()
            .into_iter()
            .filter(|row| row.field(0).as_str().map_or(false, |k| k.starts_with(prefix)))
            .collect()
    }

    /// Store `value` under `domain.key`, replacing an earlier value.
    pub fn set_property(&self, key: &str, value: &str, domain: &str) -> Result<()> {
        if self.is_read_only() {
            return Err(GeoStoreError::ReadOnly);
        }
        let _guard = self.lock_execute_sql()?;
        let adds = self.create_additions_store()?;
        let table = self.create_metadata_table(&adds)?;
        let full_key = format!("{}.{}", domain, key);
        table.delete_where(Some(&AttributeFilter::eq(META_KEY_FIELD, full_key.as_str())))?;
        let mut row = table.create_row();
        row.set_field(0, full_key);
        row.set_field(1, value);
        table.create(&mut row)?;
        Ok(())
    }

    /// Store metadata first, then the metadata table, then `default`.
    pub fn property(&self, key: &str, default: &str, domain: &str) -> String {
        let Ok(store) = self.store() else {
            return default.to_string();
        };
        if let Some(value) = store.metadata_item(domain, key).filter(|v| !v.is_empty()) {
            return value;
        }
        let Some(table) = self.metadata_table() else {
            return default.to_string();
        };
        let Ok(_guard) = self.lock_execute_sql() else {
            return default.to_string();
        };
        let full_key = format!("{}.{}", domain, key);
        table
            .features(Some(&AttributeFilter::eq(META_KEY_FIELD, full_key.as_str())))
            .ok()
            .and_then(|rows| rows.into_iter().next())
            .and_then(|row| row.field(1).as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    /// All properties of `domain`, keys without the domain prefix.
    pub fn properties(&self, domain: &str) -> BTreeMap<String, String> {
        let mut out = match self.store() {
            Ok(store) => store.metadata(domain),
            Err(_) => return BTreeMap::new(),
        };
        let Some(table) = self.metadata_table() else {
            return out;
        };
        let Ok(_guard) = self.lock_execute_sql() else {
            return out;
        };
        let prefix = format!("{}.", domain);
        for row in Self::meta_rows_with_prefix(&table, &prefix) {
            if let (Some(key), Some(value)) = (row.field(0).as_str(), row.field(1).as_str()) {
                out.insert(key[prefix.len()..].to_string(), value.to_string());
            }
        }
        out
    }

    /// Drop every property whose domain starts with `domain`.
    pub fn delete_properties(&self, domain: &str) -> Result<()> {
        let store = self.store()?;
        if !store.is_read_only() {
            store.clear_metadata(domain)?;
        }
        let Some(table) = self.metadata_table() else {
            return Ok(());
        };
        let _guard = self.lock_execute_sql()?;
        for row in Self::meta_rows_with_prefix(&table, &format!("{}.", domain)) {
            if let Some(fid) = row.fid {
                table.delete(fid)?;
            }
        }
        Ok(())
    }

    // Lifecycle

    /// Release the store handles. Children stay as inert objects.
    pub fn close(&self) {
        self.flush_stores();
        self.release_stores();
    }

    fn flush_stores(&self) {
        let stores = [self.store.read().clone(), self.adds.read().clone()];
        for store in stores.iter().flatten() {
            if let Err(err) = store.flush() {
                warn!(path = %self.path.display(), error = %err, "flush on close failed");
            }
        }
    }

    fn release_stores(&self) {
        self.store.write().take();
        self.adds.write().take();
        self.children.write().clear();
        self.children_loaded.store(false, Ordering::SeqCst);
    }

    /// Close and delete the container with its additions store, attachment
    /// folder and sidecar files.
    ///
    /// The dataset stays open if the container file cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(GeoStoreError::ReadOnly);
        }
        self.flush_stores();
        std::fs::remove_file(&self.path).map_err(|err| {
            GeoStoreError::DeleteFailed(format!("{}: {}", self.path.display(), err))
        })?;
        self.release_stores();
        if !self.is_database() {
            let adds_path = reset_extension(&self.path, ADDITIONS_EXTENSION);
            if adds_path.exists() {
                if let Err(err) = std::fs::remove_file(&adds_path) {
                    warn!(path = %adds_path.display(), error = %err, "additions store not removed");
                }
            }
        }
        remove_dir_if_exists(&self.attachments_folder());
        let aux_xml = PathBuf::from(format!("{}.aux.xml", self.path.display()));
        if aux_xml.exists() {
            if let Err(err) = std::fs::remove_file(&aux_xml) {
                warn!(path = %aux_xml.display(), error = %err, "sidecar not removed");
            }
        }
        info!(path = %self.path.display(), "dataset destroyed");
        self.notify
            .notify(&self.path.display().to_string(), ChangeCode::DeleteObject);
        Ok(())
    }
}

fn strip_non_ascii(name: &str) -> String {
    name.chars().filter(char::is_ascii).collect()
}

fn replace_forbidden_chars(name: &str) -> String {
    name.chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Maps source field `i` to destination field `i`.
fn positional_field_map(name: &str, source_count: usize, destination_count: usize) -> Vec<i32> {
    if source_count != destination_count {
        debug!(
            table = %name,
            source_count,
            destination_count,
            "field counts differ, fields are mapped by position"
        );
    }
    (0..destination_count as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing;
    use crate::store::MemoryDriver;
    use geo_types::{line_string, point, Geometry, MultiLineString, MultiPoint};

    fn create(dir: &Path, driver: MemoryDriver) -> (Arc<Dataset>, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        let file = format!("data.{}", driver.extension());
        let dataset = Dataset::create(
            &dir.join(file),
            Arc::new(driver),
            Settings::default(),
            Arc::clone(&notify),
        )
        .unwrap();
        (dataset, notify)
    }

    fn fields() -> Vec<FieldDefn> {
        vec![FieldDefn::new("name", FieldType::String)]
    }

    #[test]
    fn names_are_cleaned_and_made_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        assert_eq!(ds.normalize_dataset_name("").unwrap(), "new_dataset");
        assert_eq!(ds.normalize_dataset_name("a-b:c").unwrap(), "a_b_c");
        assert_eq!(ds.normalize_dataset_name("дороги roads").unwrap(), " roads");
        assert_eq!(ds.normalize_dataset_name("nga_meta").unwrap(), "nga_meta_1");

        ds.create_table("roads", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        let first = ds.normalize_dataset_name("Roads").unwrap();
        assert_eq!(first, "Roads_1");
        assert_eq!(ds.normalize_dataset_name("roads_x").unwrap(), "roads_x");
    }

    #[test]
    fn field_names_avoid_reserved_words() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _) = create(dir.path(), MemoryDriver::database());
        assert_eq!(db.normalize_field_name("select"), "select_");
        assert_eq!(db.normalize_field_name("1st"), "Fld_1st");
        assert_eq!(db.normalize_field_name("a+b"), "a_b");
        assert_eq!(db.normalize_field_name("title"), "title");

        let (flat, _) = create(dir.path(), MemoryDriver::flat_file());
        assert_eq!(flat.normalize_field_name("select"), "select");
    }

    #[test]
    fn renamed_fields_keep_original_name() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        let progress = Progress::new(move |code, _, msg| {
            if code == ResultCode::Warning {
                sink.lock().push(msg.to_string());
            }
            true
        });
        let table = ds
            .create_table(
                "t",
                &[FieldDefn::new("order", FieldType::String)],
                &Options::new(),
                &progress,
            )
            .unwrap();
        assert_eq!(
            warnings.lock().clone(),
            vec!["Field order of source table was renamed to order_ in destination table".to_string()]
        );
        let field = &table.fields()[0];
        assert_eq!(field.name, "order_");
        assert_eq!(field.original_name, "order");
    }

    #[test]
    fn refresh_keeps_existing_children() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        ds.create_table("a", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        let before = ds.get_child("a").unwrap();

        let store = ds.store().unwrap();
        store
            .create_layer(&LayerSchema::table("b", fields()), &Options::new())
            .unwrap();
        ds.refresh();
        let after = ds.get_child("a").unwrap();
        assert!(before.ptr_eq(&after));
        assert!(ds.get_child("b").is_some());

        store.delete_layer("a").unwrap();
        ds.refresh();
        let names: Vec<String> = ds.children().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn hidden_tables_are_not_children() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        let t = ds
            .create_table("t", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        t.set_property("k", "v", NG_ADDITIONS_KEY).unwrap();
        ds.create_edit_history_table("t").unwrap();
        ds.refresh();
        let path = ds.path().to_path_buf();
        drop(t);
        drop(ds);

        let reopened = Dataset::open(
            &path,
            Arc::new(MemoryDriver::database()),
            Settings::default(),
            Arc::new(Notify::new()),
            false,
        )
        .unwrap();
        let names: Vec<String> = reopened
            .children()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["t".to_string()]);
        assert_eq!(reopened.property("k", "", "t.nga"), "v");
    }

    #[test]
    fn properties_upsert_and_delete_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::flat_file());
        ds.set_property("color", "red", "roads.nga").unwrap();
        ds.set_property("color", "blue", "roads.nga").unwrap();
        ds.set_property("width", "2", "roads.nga").unwrap();
        ds.set_property("color", "green", "rivers.nga").unwrap();
        assert!(reset_extension(ds.path(), ADDITIONS_EXTENSION).exists());

        assert_eq!(ds.property("color", "none", "roads.nga"), "blue");
        assert_eq!(ds.property("missing", "none", "roads.nga"), "none");
        let props = ds.properties("roads.nga");
        assert_eq!(props.len(), 2);
        assert_eq!(props["width"], "2");

        ds.delete_properties("roads").unwrap();
        assert!(ds.properties("roads.nga").is_empty());
        assert_eq!(ds.property("color", "", "rivers.nga"), "green");
        assert_eq!(ds.property("version", "", "roads"), "");
    }

    #[test]
    fn batch_coalesces_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, notify) = create(dir.path(), MemoryDriver::database());
        let table = ds
            .create_table("t", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        let events = testing::recorder(&notify);
        {
            let _outer = ds.batch_guard();
            let _inner = ds.batch_guard();
            for _ in 0..3 {
                let mut f = table.create_feature();
                table.insert_feature(&mut f, false).unwrap();
            }
            assert!(ds.is_batch_operation());
        }
        assert!(!ds.is_batch_operation());
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, ChangeCode::ChangeObject);
        assert_eq!(events[0].0, ds.path().display().to_string());
    }

    #[test]
    fn paste_renames_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, notify) = create(dir.path(), MemoryDriver::database());
        let roads = ds
            .create_feature_class(
                "roads",
                GeometryType::Unknown,
                Some(3857),
                &fields(),
                &Options::new(),
                &Progress::default(),
            )
            .unwrap();
        for geom in [
            point!(x: 1.0, y: 1.0).into(),
            MultiPoint(vec![point!(x: 2.0, y: 2.0)]).into(),
        ] {
            let mut f = roads.create_feature();
            f.geometry = Some(geom);
            roads.insert_feature(&mut f, false).unwrap();
        }
        let events = testing::recorder(&notify);

        let source = ds.get_child("roads").unwrap();
        ds.paste(&source, &Options::new(), &Progress::default())
            .unwrap();

        let copy = ds.get_child("roads_1").unwrap();
        let copy = copy.as_feature_class().unwrap();
        assert_eq!(copy.geometry_type(), GeometryType::MultiPoint);
        assert_eq!(copy.feature_count(), 2);
        assert!(events
            .lock()
            .iter()
            .any(|(uri, code)| uri.ends_with("/roads_1") && *code == ChangeCode::CreateObject));
    }

    fn mixed_layer(ds: &Dataset, name: &str) -> Arc<FeatureClass> {
        let layer = ds
            .create_feature_class(
                name,
                GeometryType::Unknown,
                Some(3857),
                &fields(),
                &Options::new(),
                &Progress::default(),
            )
            .unwrap();
        let geoms: Vec<Geometry<f64>> = vec![
            point!(x: 1.0, y: 1.0).into(),
            point!(x: 3.0, y: 3.0).into(),
            line_string![(x: 0.0, y: 0.0), (x: 5.0, y: 5.0)].into(),
        ];
        for geom in geoms {
            let mut f = layer.create_feature();
            f.set_field(0, "x");
            f.geometry = Some(geom);
            layer.insert_feature(&mut f, false).unwrap();
        }
        layer
    }

    fn geometry_types_of(layer: &FeatureClass) -> Vec<GeometryType> {
        layer
            .features()
            .unwrap()
            .iter()
            .filter_map(|f| f.geometry.as_ref().map(GeometryType::of))
            .collect()
    }

    #[test]
    fn paste_splits_mixed_layer_per_geometry_type() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _) = create(dir.path(), MemoryDriver::database());
        let (dst, _) = create(dir.path(), MemoryDriver::flat_file());
        mixed_layer(&src, "mix");

        let child = src.get_child("mix").unwrap();
        dst.paste(&child, &Options::new(), &Progress::default())
            .unwrap();

        let mut names: Vec<String> =
            dst.children().iter().map(|c| c.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["mix_ln".to_string(), "mix_pt".to_string()]);

        let points = dst.get_child("mix_pt").unwrap();
        let points = points.as_feature_class().unwrap();
        assert_eq!(points.geometry_type(), GeometryType::Point);
        assert_eq!(points.feature_count(), 2);
        assert_eq!(geometry_types_of(points), vec![GeometryType::Point; 2]);

        let lines = dst.get_child("mix_ln").unwrap();
        let lines = lines.as_feature_class().unwrap();
        assert_eq!(lines.geometry_type(), GeometryType::LineString);
        assert_eq!(geometry_types_of(lines), vec![GeometryType::LineString]);
    }

    #[test]
    fn paste_forces_split_layers_to_multi() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _) = create(dir.path(), MemoryDriver::database());
        let (dst, _) = create(dir.path(), MemoryDriver::flat_file());
        mixed_layer(&src, "mix");

        let child = src.get_child("mix").unwrap();
        let options = Options::new().with(options::FORCE_GEOMETRY_TO_MULTI, "YES");
        dst.paste(&child, &options, &Progress::default()).unwrap();

        let points = dst.get_child("mix_pt").unwrap();
        let points = points.as_feature_class().unwrap();
        assert_eq!(points.geometry_type(), GeometryType::MultiPoint);
        assert_eq!(geometry_types_of(points), vec![GeometryType::MultiPoint; 2]);

        let lines = dst.get_child("mix_ln").unwrap();
        let lines = lines.as_feature_class().unwrap();
        assert_eq!(lines.geometry_type(), GeometryType::MultiLineString);
        assert_eq!(geometry_types_of(lines), vec![GeometryType::MultiLineString]);
    }

    #[test]
    fn paste_accepts_one_geometry_family() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        mixed_layer(&ds, "mix");

        let child = ds.get_child("mix").unwrap();
        let options = Options::new()
            .with(options::ACCEPT_GEOMETRY, "LINESTRING")
            .with(options::NEW_NAME, "roads");
        ds.paste(&child, &options, &Progress::default()).unwrap();

        let roads = ds.get_child("roads").unwrap();
        let roads = roads.as_feature_class().unwrap();
        assert_eq!(roads.geometry_type(), GeometryType::LineString);
        assert_eq!(roads.feature_count(), 1);
    }

    #[test]
    fn paste_multi_only_layer() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        let ml = ds
            .create_feature_class(
                "ml",
                GeometryType::Unknown,
                Some(3857),
                &fields(),
                &Options::new(),
                &Progress::default(),
            )
            .unwrap();
        let mut f = ml.create_feature();
        f.geometry = Some(
            MultiLineString(vec![line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]]).into(),
        );
        ml.insert_feature(&mut f, false).unwrap();

        let child = ds.get_child("ml").unwrap();
        ds.paste(&child, &Options::new(), &Progress::default())
            .unwrap();
        let copy = ds.get_child("ml_1").unwrap();
        let copy = copy.as_feature_class().unwrap();
        assert_eq!(copy.geometry_type(), GeometryType::MultiLineString);
        assert_eq!(copy.feature_count(), 1);
    }

    #[test]
    fn name_collisions_are_limited() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        for name in ["t", "t_1", "t_2"] {
            ds.create_table(name, &fields(), &Options::new(), &Progress::default())
                .unwrap();
        }
        assert_eq!(ds.unique_name("t", 4).unwrap(), "t_3");
        assert!(matches!(
            ds.unique_name("t", 3),
            Err(GeoStoreError::InvalidName(name)) if name == "t"
        ));
    }

    #[test]
    fn paste_move_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _) = create(dir.path(), MemoryDriver::database());
        let (dst, _) = create(dir.path(), MemoryDriver::flat_file());
        let table = src
            .create_table("people", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        let mut f = table.create_feature();
        f.set_field(0, "ann");
        table.insert_feature(&mut f, false).unwrap();

        let child = src.get_child("people").unwrap();
        let options = Options::new()
            .with(options::MOVE, "ON")
            .with(options::NEW_NAME, "staff");
        dst.paste(&child, &options, &Progress::default()).unwrap();

        assert!(src.get_child("people").is_none());
        let moved = dst.get_child("staff").unwrap();
        assert_eq!(moved.table().feature_count(), 1);
    }

    #[test]
    fn execute_sql_returns_query_result() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, _) = create(dir.path(), MemoryDriver::database());
        let table = ds
            .create_table("t", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        for name in ["a", "b"] {
            let mut f = table.create_feature();
            f.set_field(0, name);
            table.insert_feature(&mut f, false).unwrap();
        }
        let result = ds
            .execute_sql("SELECT * FROM t WHERE name = 'b'", "")
            .unwrap()
            .unwrap();
        assert!(result.table().is_query_result());
        assert_eq!(result.table().feature_count(), 1);
        assert!(ds.execute_sql("DELETE FROM t", "").unwrap().is_none());
        assert_eq!(table.feature_count(), 0);
    }

    #[test]
    fn destroy_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, notify) = create(dir.path(), MemoryDriver::flat_file());
        ds.set_property("k", "v", "x").unwrap();
        std::fs::create_dir_all(ds.attachments_folder().join("t")).unwrap();
        let aux_xml = PathBuf::from(format!("{}.aux.xml", ds.path().display()));
        std::fs::write(&aux_xml, "<x/>").unwrap();
        let events = testing::recorder(&notify);

        ds.destroy().unwrap();
        assert!(!ds.path().exists());
        assert!(!reset_extension(ds.path(), ADDITIONS_EXTENSION).exists());
        assert!(!ds.attachments_folder().exists());
        assert!(!aux_xml.exists());
        assert!(!ds.is_opened());
        assert_eq!(events.lock()[0].1, ChangeCode::DeleteObject);
    }

    #[test]
    fn failed_destroy_keeps_dataset_open() {
        let dir = tempfile::tempdir().unwrap();
        let (ds, notify) = create(dir.path(), MemoryDriver::flat_file());
        ds.create_table("t", &fields(), &Options::new(), &Progress::default())
            .unwrap();
        // A non-empty directory in place of the container cannot be removed
        std::fs::remove_file(ds.path()).unwrap();
        std::fs::create_dir(ds.path()).unwrap();
        std::fs::write(ds.path().join("keep"), "x").unwrap();
        let events = testing::recorder(&notify);

        assert!(matches!(ds.destroy(), Err(GeoStoreError::DeleteFailed(_))));
        assert!(ds.is_opened());
        assert!(ds.get_child("t").is_some());
        assert!(events.lock().is_empty());
    }
}
