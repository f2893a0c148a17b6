use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::dataset::{AuxTable, Dataset, NG_ADDITIONS_KEY};
use crate::error::{GeoStoreError, Result, ResultCode};
use crate::notify::ChangeCode;
use crate::options::{self, Options};
use crate::progress::Progress;
use crate::store::{AttributeFilter, Cmp, Feature, FeatureStore, FieldType, LayerSchema};

/// Sentinel id for "no feature" or "no attachment" in the edit log.
pub const NOT_FOUND: i64 = -1;

pub const LOG_EDIT_HISTORY_KEY: &str = "LOG_EDIT_HISTORY";

// Edit log columns
pub(crate) const FEATURE_ID_FIELD: &str = "ffid";
pub(crate) const ATTACH_FEATURE_ID_FIELD: &str = "afid";
pub(crate) const OPERATION_FIELD: &str = "op";

// Attachment columns
pub(crate) const ATTACH_FILE_NAME_FIELD: &str = "name";
pub(crate) const ATTACH_DESCRIPTION_FIELD: &str = "descript";

/// Field descriptor with the display alias and pre-normalisation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub alias: String,
    pub original_name: String,
    pub field_type: FieldType,
}

/// One pending change in the edit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditOperation {
    pub fid: i64,
    pub aid: i64,
    pub code: ChangeCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    /// Size on disk at query time, -1 if the file is missing.
    pub size: i64,
}

pub(crate) enum Backing {
    Dataset(Weak<Dataset>),
    /// Query results own their rows.
    Detached(Arc<dyn FeatureStore>),
}

/// A named set of rows sharing one schema.
pub struct Table {
    name: String,
    backing: Backing,
    fields: RwLock<Option<Vec<Field>>>,
    filter: RwLock<Option<AttributeFilter>>,
    save_edit_history: Mutex<Option<bool>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("query_result", &self.is_query_result())
            .finish()
    }
}

impl Table {
    pub(crate) fn new(name: impl Into<String>, dataset: Weak<Dataset>) -> Self {
        Self::with_backing(name.into(), Backing::Dataset(dataset))
    }

    pub(crate) fn detached(name: impl Into<String>, store: Arc<dyn FeatureStore>) -> Self {
        Self::with_backing(name.into(), Backing::Detached(store))
    }

    fn with_backing(name: String, backing: Backing) -> Self {
        Self {
            name,
            backing,
            fields: RwLock::new(None),
            filter: RwLock::new(None),
            save_edit_history: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dataset(&self) -> Option<Arc<Dataset>> {
        match &self.backing {
            Backing::Dataset(weak) => weak.upgrade(),
            Backing::Detached(_) => None,
        }
    }

    pub fn is_query_result(&self) -> bool {
        matches!(self.backing, Backing::Detached(_))
    }

    /// `<dataset path>/<name>`, the prefix of feature notification URIs.
    pub fn full_name(&self) -> String {
        match self.dataset() {
            Some(dataset) => format!("{}/{}", dataset.path().display(), self.name),
            None => self.name.clone(),
        }
    }

    /// Run `f` against the backing store, under the dataset SQL lock.
    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&dyn FeatureStore) -> Result<R>) -> Result<R> {
        match &self.backing {
            Backing::Dataset(weak) => {
                let dataset = weak.upgrade().ok_or(GeoStoreError::NotOpened)?;
                let store = dataset.store()?;
                let _guard = dataset.lock_execute_sql()?;
                f(store.as_ref())
            }
            Backing::Detached(store) => f(store.as_ref()),
        }
    }

    pub(crate) fn notify(&self, uri: &str, code: ChangeCode) {
        if let Some(dataset) = self.dataset() {
            dataset.notifier().notify(uri, code);
        }
    }

    fn is_batch(&self) -> bool {
        self.dataset().map_or(false, |d| d.is_batch_operation())
    }

    pub fn schema(&self) -> Option<LayerSchema> {
        self.with_store(|store| Ok(store.layer_schema(&self.name)))
            .ok()
            .flatten()
    }

    /// New unsaved row sized to the schema.
    pub fn create_feature(&self) -> Feature {
        let count = self.schema().map_or(0, |s| s.fields.len());
        Feature::new(count)
    }

    pub fn get_feature(&self, fid: i64) -> Option<Feature> {
        self.with_store(|store| Ok(store.get_feature(&self.name, fid)))
            .ok()
            .flatten()
    }

    pub fn feature_count(&self) -> u64 {
        match self.with_store(|store| store.feature_count(&self.name)) {
            Ok(count) => count,
            Err(err) => {
                debug!(table = %self.name, error = %err, "feature count failed");
                0
            }
        }
    }

    pub fn set_attribute_filter(&self, filter: Option<AttributeFilter>) {
        *self.filter.write() = filter;
    }

    /// Rows matching the current attribute filter, in scan order.
    pub fn features(&self) -> Result<Vec<Feature>> {
        let filter = self.filter.read().clone();
        self.with_store(|store| store.features(&self.name, filter.as_ref()))
    }

    pub fn insert_feature(&self, feature: &mut Feature, log_edits: bool) -> Result<()> {
        let fid = self.with_store(|store| store.create_feature(&self.name, feature))?;
        if log_edits {
            let op = self.log_edit_feature(Some(fid), None, ChangeCode::CreateFeature);
            self.log_edit_operation(op);
        }
        if !self.is_batch() {
            self.notify(&format!("{}#{}", self.full_name(), fid), ChangeCode::CreateFeature);
        }
        Ok(())
    }

    pub fn update_feature(&self, feature: &Feature, log_edits: bool) -> Result<()> {
        self.with_store(|store| store.set_feature(&self.name, feature))?;
        let fid = feature.fid.unwrap_or(NOT_FOUND);
        if log_edits {
            let op = self.log_edit_feature(feature.fid, None, ChangeCode::ChangeFeature);
            self.log_edit_operation(op);
        }
        if !self.is_batch() {
            self.notify(&format!("{}#{}", self.full_name(), fid), ChangeCode::ChangeFeature);
        }
        Ok(())
    }

    pub fn delete_feature(&self, fid: i64, log_edits: bool) -> Result<()> {
        let op = if log_edits && self.save_edit_history() {
            let existing = self.get_feature(fid).map(|_| fid);
            self.log_edit_feature(existing, None, ChangeCode::DeleteFeature)
        } else {
            None
        };

        self.with_store(|store| store.delete_feature(&self.name, fid))?;
        self.delete_attachments(fid, log_edits);
        if log_edits {
            self.log_edit_operation(op);
        }
        if !self.is_batch() {
            self.notify(&format!("{}#{}", self.full_name(), fid), ChangeCode::DeleteFeature);
        }
        Ok(())
    }

    /// Remove every row, the attachments and their files. Notifies once.
    pub fn delete_features(&self, log_edits: bool) -> Result<()> {
        let dataset = self.dataset().ok_or(GeoStoreError::NotOpened)?;
        dataset.delete_features(&self.name)?;
        if log_edits {
            let op = self.log_edit_feature(None, None, ChangeCode::DeleteAllFeatures);
            self.log_edit_operation(op);
        }
        self.notify(&self.full_name(), ChangeCode::DeleteAllFeatures);
        // The attachments table may not exist
        let _ = dataset.destroy_attachments_table(&self.name);
        if let Some(path) = self.attachments_path() {
            remove_dir_if_exists(&path);
        }
        Ok(())
    }

    /// Stream every row of `src` into this table.
    ///
    /// `field_map[i]` is the destination index of source field `i`. A failed
    /// insert is reported as a warning and copying continues. Cancellation
    /// leaves the rows copied so far in place.
    pub fn copy_rows(&self, src: &Table, field_map: &[i32], progress: &Progress) -> Result<()> {
        progress.on_progress(
            ResultCode::InProcess,
            0.0,
            &format!("Start copy records from '{}' to '{}'", src.name(), self.name),
        );

        let _batch = self.dataset().map(|d| d.batch_guard());
        let rows = src.features()?;
        let total = rows.len().max(1) as f64;
        let mut counter = 0usize;
        for row in rows {
            let complete = counter as f64 / total;
            if !progress.on_progress(ResultCode::InProcess, complete, "Copy in process ...") {
                return Err(GeoStoreError::Canceled);
            }

            let mut dst = self.create_feature();
            dst.set_fields_from(&row, field_map);
            if let Err(err) = self.insert_feature(&mut dst, false) {
                debug!(table = %self.name, error = %err, "copy insert failed");
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
            &format!("Done. Copied {} rows", counter),
        );
        Ok(())
    }

    /// Field list with aliases and original names, computed once.
    pub fn fields(&self) -> Vec<Field> {
        if let Some(fields) = self.fields.read().as_ref() {
            return fields.clone();
        }
        let fields = self.fill_fields();
        *self.fields.write() = Some(fields.clone());
        fields
    }

    pub fn invalidate_fields(&self) {
        *self.fields.write() = None;
    }

    fn fill_fields(&self) -> Vec<Field> {
        let Some(schema) = self.schema() else {
            return Vec::new();
        };
        let props = self.properties(NG_ADDITIONS_KEY);
        schema
            .fields
            .iter()
            .enumerate()
            .map(|(i, defn)| {
                let lookup = |key: String| {
                    props
                        .get(&key)
                        .filter(|v| !v.is_empty())
                        .cloned()
                        .unwrap_or_else(|| defn.name.clone())
                };
                Field {
                    name: defn.name.clone(),
                    alias: lookup(format!("FIELD_{}_ALIAS", i)),
                    original_name: lookup(format!("FIELD_{}_NAME", i)),
                    field_type: defn.field_type,
                }
            })
            .collect()
    }

    // Attachments

    /// `<dataset path with extension "attachments">/<table>`
    pub fn attachments_path(&self) -> Option<PathBuf> {
        let dataset = self.dataset()?;
        Some(dataset.attachments_folder().join(&self.name))
    }

    fn attachment_file(&self, fid: i64, aid: i64) -> Option<PathBuf> {
        Some(
            self.attachments_path()?
                .join(fid.to_string())
                .join(aid.to_string()),
        )
    }

    fn attachments_table(&self, create: bool) -> Option<(Arc<Dataset>, AuxTable)> {
        let dataset = self.dataset()?;
        let table = match dataset.get_attachments_table(&self.name) {
            Some(table) => table,
            None if create => match dataset.create_attachments_table(&self.name) {
                Ok(table) => table,
                Err(err) => {
                    warn!(table = %self.name, error = %err, "attachments table unavailable");
                    return None;
                }
            },
            None => return None,
        };
        Some((dataset, table))
    }

    fn feature_exists(&self, fid: i64) -> Option<i64> {
        self.get_feature(fid).map(|_| fid)
    }

    /// Store a file for feature `fid`. `MOVE` in `options` moves instead of
    /// copying. Returns the attachment id.
    pub fn add_attachment(
        &self,
        fid: i64,
        file_name: &str,
        description: &str,
        file_path: &Path,
        options: &Options,
        log_edits: bool,
    ) -> Option<i64> {
        let (dataset, table) = self.attachments_table(true)?;
        let moving = options.as_bool(options::MOVE, false);

        let mut row = table.create_row();
        row.set_field(0, fid);
        row.set_field(1, file_name);
        row.set_field(2, description);
        let aid = {
            let _guard = dataset.lock_execute_sql().ok()?;
            match table.create(&mut row) {
                Ok(aid) => aid,
                Err(err) => {
                    debug!(table = %self.name, error = %err, "add attachment failed");
                    return None;
                }
            }
        };

        let dst = self.attachment_file(fid, aid)?;
        if let Some(parent) = dst.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "cannot create attachment folder");
            }
        }
        if file_path.exists() {
            let result = if moving {
                move_file(file_path, &dst)
            } else {
                std::fs::copy(file_path, &dst).map(|_| ())
            };
            if let Err(err) = result {
                warn!(src = %file_path.display(), error = %err, "attachment file transfer failed");
            }
        }

        if log_edits {
            let op = self.log_edit_feature(
                self.feature_exists(fid),
                Some(aid),
                ChangeCode::CreateAttachment,
            );
            self.log_edit_operation(op);
        }
        Some(aid)
    }

    pub fn update_attachment(
        &self,
        aid: i64,
        file_name: Option<&str>,
        description: Option<&str>,
        log_edits: bool,
    ) -> bool {
        let Some((dataset, table)) = self.attachments_table(true) else {
            return false;
        };
        let Ok(_guard) = dataset.lock_execute_sql() else {
            return false;
        };
        let Some(mut row) = table.get(aid) else {
            return false;
        };
        if let Some(name) = file_name {
            row.set_field(1, name);
        }
        if let Some(description) = description {
            row.set_field(2, description);
        }
        if let Err(err) = table.set(&row) {
            debug!(table = %self.name, aid, error = %err, "update attachment failed");
            return false;
        }

        if log_edits {
            let fid = row.field(0).as_i64().unwrap_or(NOT_FOUND);
            let op = self.log_edit_feature(
                self.feature_exists(fid),
                Some(aid),
                ChangeCode::ChangeAttachment,
            );
            self.log_edit_operation(op);
        }
        true
    }

    pub fn delete_attachment(&self, aid: i64, log_edits: bool) -> bool {
        let Some((dataset, table)) = self.attachments_table(true) else {
            return false;
        };
        let row = {
            let Ok(_guard) = dataset.lock_execute_sql() else {
                return false;
            };
            let Some(row) = table.get(aid) else {
                return false;
            };
            if let Err(err) = table.delete(aid) {
                debug!(table = %self.name, aid, error = %err, "delete attachment failed");
                return false;
            }
            row
        };

        let fid = row.field(0).as_i64().unwrap_or(NOT_FOUND);
        let mut result = true;
        if let Some(path) = self.attachment_file(fid, aid) {
            if path.exists() {
                result = std::fs::remove_file(&path).is_ok();
            }
        }

        if log_edits {
            let op = self.log_edit_feature(
                self.feature_exists(fid),
                Some(aid),
                ChangeCode::DeleteAttachment,
            );
            self.log_edit_operation(op);
        }
        result
    }

    /// Drop all attachments of `fid` with their folder.
    pub fn delete_attachments(&self, fid: i64, log_edits: bool) -> bool {
        let Some(dataset) = self.dataset() else {
            return false;
        };
        if let Some(table) = dataset.get_attachments_table(&self.name) {
            if let Ok(_guard) = dataset.lock_execute_sql() {
                let filter = AttributeFilter::eq(ATTACH_FEATURE_ID_FIELD, fid);
                if let Err(err) = table.delete_where(Some(&filter)) {
                    debug!(table = %self.name, fid, error = %err, "delete attachments failed");
                }
            }
        }
        if let Some(path) = self.attachments_path() {
            remove_dir_if_exists(&path.join(fid.to_string()));
        }

        if log_edits {
            let op = self.log_edit_feature(
                self.feature_exists(fid),
                None,
                ChangeCode::DeleteAllAttachments,
            );
            self.log_edit_operation(op);
        }
        true
    }

    pub fn attachments(&self, fid: i64) -> Vec<AttachmentInfo> {
        let Some((dataset, table)) = self.attachments_table(true) else {
            return Vec::new();
        };
        let rows = {
            let Ok(_guard) = dataset.lock_execute_sql() else {
                return Vec::new();
            };
            table
                .features(Some(&AttributeFilter::eq(ATTACH_FEATURE_ID_FIELD, fid)))
                .unwrap_or_default()
        };

        rows.into_iter()
            .filter_map(|row| {
                let id = row.fid?;
                let path = self.attachment_file(fid, id)?;
                let size = std::fs::metadata(&path)
                    .map(|m| m.len() as i64)
                    .unwrap_or(NOT_FOUND);
                Some(AttachmentInfo {
                    id,
                    name: row.field(1).as_str().unwrap_or_default().to_string(),
                    description: row.field(2).as_str().unwrap_or_default().to_string(),
                    path,
                    size,
                })
            })
            .collect()
    }

    // Edit log

    /// Whether `LOG_EDIT_HISTORY` is ON for this table.
    pub fn save_edit_history(&self) -> bool {
        let mut cached = self.save_edit_history.lock();
        if let Some(value) = *cached {
            return value;
        }
        if self.is_query_result() {
            return false;
        }
        let value = self
            .property(LOG_EDIT_HISTORY_KEY, "OFF", NG_ADDITIONS_KEY)
            .eq_ignore_ascii_case("ON");
        *cached = Some(value);
        value
    }

    fn log_edit_feature(
        &self,
        fid: Option<i64>,
        aid: Option<i64>,
        code: ChangeCode,
    ) -> Option<EditOperation> {
        if !self.save_edit_history() {
            return None;
        }
        Some(EditOperation {
            fid: fid.unwrap_or(NOT_FOUND),
            aid: aid.unwrap_or(NOT_FOUND),
            code,
        })
    }

    fn log_edit_operation(&self, op: Option<EditOperation>) {
        let Some(op) = op else {
            return;
        };
        if let Err(err) = self.compact_edit_log(op) {
            debug!(table = %self.name, code = ?op.code, error = %err, "log operation failed");
        }
    }

    // Record `op` while keeping the log minimal. The log holds only what is
    // needed to replay local changes against a remote copy.
    fn compact_edit_log(&self, op: EditOperation) -> Result<()> {
        let dataset = self.dataset().ok_or(GeoStoreError::NotOpened)?;
        let history = match dataset.get_edit_history_table(&self.name) {
            Some(table) => table,
            None => dataset.create_edit_history_table(&self.name)?,
        };
        let _guard = dataset.lock_execute_sql()?;

        let append = |op: &EditOperation| -> Result<()> {
            let mut row = history.create_row();
            row.set_field(0, op.fid);
            row.set_field(1, op.aid);
            row.set_field(2, op.code.mask() as i64);
            history.create(&mut row).map(|_| ())
        };
        let by_code = |code: ChangeCode| AttributeFilter::eq(OPERATION_FIELD, code.mask() as i64);

        match op.code {
            ChangeCode::DeleteAllFeatures => {
                history.delete_where(None)?;
                return append(&op);
            }
            ChangeCode::DeleteAllAttachments => {
                if op.fid == NOT_FOUND {
                    return Ok(());
                }
                let filter = AttributeFilter::eq(FEATURE_ID_FIELD, op.fid).and(
                    ATTACH_FEATURE_ID_FIELD,
                    Cmp::Ne,
                    NOT_FOUND,
                );
                history.delete_where(Some(&filter))?;
                return append(&op);
            }
            _ => {}
        }

        // A targeted edit supersedes a stale delete-all marker
        history.delete_where(Some(&by_code(ChangeCode::DeleteAllFeatures)))?;

        if matches!(op.code, ChangeCode::CreateAttachment | ChangeCode::ChangeAttachment) {
            if op.fid == NOT_FOUND {
                return Ok(());
            }
            let filter = by_code(ChangeCode::DeleteAllAttachments).and_eq(FEATURE_ID_FIELD, op.fid);
            history.delete_where(Some(&filter))?;
        }

        if matches!(op.code, ChangeCode::CreateFeature | ChangeCode::CreateAttachment) {
            if op.fid == NOT_FOUND {
                return Ok(());
            }
            return append(&op);
        }

        let entries = history.features(Some(&AttributeFilter::eq(FEATURE_ID_FIELD, op.fid)))?;
        let entry_code = |row: &Feature| {
            row.field(2)
                .as_i64()
                .and_then(|c| ChangeCode::from_mask(c as u32))
        };
        let entry_aid = |row: &Feature| row.field(1).as_i64().unwrap_or(NOT_FOUND);

        match op.code {
            ChangeCode::DeleteFeature => {
                if op.fid == NOT_FOUND {
                    return Ok(());
                }
                if !entries.is_empty() {
                    history.delete_where(Some(&AttributeFilter::eq(FEATURE_ID_FIELD, op.fid)))?;
                }
                // Created and deleted before any sync: nothing to replay
                if entries
                    .iter()
                    .any(|row| entry_code(row) == Some(ChangeCode::CreateFeature))
                {
                    return Ok(());
                }
                append(&op)
            }
            ChangeCode::DeleteAttachment => {
                if op.fid == NOT_FOUND || op.aid == NOT_FOUND {
                    return Ok(());
                }
                match entries.iter().find(|row| entry_aid(row) == op.aid) {
                    Some(row) if entry_code(row) == Some(ChangeCode::CreateAttachment) => {
                        match row.fid {
                            Some(fid) => history.delete(fid),
                            None => Ok(()),
                        }
                    }
                    Some(row) => {
                        let mut row = row.clone();
                        row.set_field(2, op.code.mask() as i64);
                        history.set(&row)
                    }
                    None => append(&op),
                }
            }
            ChangeCode::ChangeFeature => {
                if op.fid == NOT_FOUND || !entries.is_empty() {
                    return Ok(());
                }
                append(&op)
            }
            ChangeCode::ChangeAttachment => {
                if op.fid == NOT_FOUND || op.aid == NOT_FOUND {
                    return Ok(());
                }
                if entries.iter().any(|row| entry_aid(row) == op.aid) {
                    return Ok(());
                }
                append(&op)
            }
            _ => Ok(()),
        }
    }

    /// Pending edit operations in log order.
    pub fn edit_operations(&self) -> Vec<EditOperation> {
        let Some(dataset) = self.dataset() else {
            return Vec::new();
        };
        let Some(history) = dataset.get_edit_history_table(&self.name) else {
            return Vec::new();
        };
        let Ok(_guard) = dataset.lock_execute_sql() else {
            return Vec::new();
        };
        history
            .features(None)
            .unwrap_or_default()
            .iter()
            .filter_map(|row| {
                Some(EditOperation {
                    fid: row.field(0).as_i64()?,
                    aid: row.field(1).as_i64()?,
                    code: ChangeCode::from_mask(row.field(2).as_i64()? as u32)?,
                })
            })
            .collect()
    }

    /// Remove log rows matching the operation's feature and attachment ids.
    pub fn delete_edit_operation(&self, op: &EditOperation) {
        let Some(dataset) = self.dataset() else {
            return;
        };
        let Some(history) = dataset.get_edit_history_table(&self.name) else {
            return;
        };
        let Ok(_guard) = dataset.lock_execute_sql() else {
            return;
        };
        let filter = AttributeFilter::eq(FEATURE_ID_FIELD, op.fid).and_eq(ATTACH_FEATURE_ID_FIELD, op.aid);
        if let Err(err) = history.delete_where(Some(&filter)) {
            debug!(table = %self.name, error = %err, "delete edit operation failed");
        }
    }

    // Properties

    fn property_domain(&self, domain: &str) -> String {
        format!("{}.{}", self.name, domain)
    }

    pub fn set_property(&self, key: &str, value: &str, domain: &str) -> Result<()> {
        let dataset = self.dataset().ok_or(GeoStoreError::NotOpened)?;
        self.check_set_property(&dataset, key, value, domain);
        dataset.set_property(key, value, &self.property_domain(domain))?;
        if key.starts_with("FIELD_") {
            self.invalidate_fields();
        }
        Ok(())
    }

    fn check_set_property(&self, dataset: &Dataset, key: &str, value: &str, domain: &str) {
        if !key.eq_ignore_ascii_case(LOG_EDIT_HISTORY_KEY)
            || !domain.eq_ignore_ascii_case(NG_ADDITIONS_KEY)
        {
            return;
        }
        let enabled = value.eq_ignore_ascii_case("ON");
        let mut cached = self.save_edit_history.lock();
        let previous = cached.unwrap_or(false);
        *cached = Some(enabled);
        if previous && !enabled {
            if let Err(err) = dataset.clear_edit_history_table(&self.name) {
                debug!(table = %self.name, error = %err, "clear edit log failed");
            }
        }
    }

    pub fn property(&self, key: &str, default: &str, domain: &str) -> String {
        match self.dataset() {
            Some(dataset) => dataset.property(key, default, &self.property_domain(domain)),
            None => default.to_string(),
        }
    }

    pub fn properties(&self, domain: &str) -> BTreeMap<String, String> {
        match self.dataset() {
            Some(dataset) => dataset.properties(&self.property_domain(domain)),
            None => BTreeMap::new(),
        }
    }

    /// Remove the properties of every domain of this table.
    pub fn delete_properties(&self) -> Result<()> {
        let dataset = self.dataset().ok_or(GeoStoreError::NotOpened)?;
        dataset.delete_properties(&self.name)
    }

    // Lifecycle

    pub fn can_destroy(&self) -> bool {
        !self.is_query_result() && self.dataset().map_or(false, |d| !d.is_read_only())
    }

    /// Drop the layer with its attachments and edit log.
    pub fn destroy(&self) -> Result<()> {
        if self.is_query_result() {
            return Err(GeoStoreError::Unsupported(self.name.clone()));
        }
        let dataset = self.dataset().ok_or(GeoStoreError::NotOpened)?;
        if dataset.is_read_only() {
            return Err(GeoStoreError::ReadOnly);
        }
        let full_name = self.full_name();
        let attachments_path = self.attachments_path();
        self.set_attribute_filter(None);

        dataset.destroy_table(&self.name)?;
        self.notify(&full_name, ChangeCode::DeleteObject);

        // Side tables may not exist
        let _ = dataset.destroy_attachments_table(&self.name);
        if let Some(path) = attachments_path {
            remove_dir_if_exists(&path);
        }
        let _ = dataset.destroy_edit_history_table(&self.name);
        Ok(())
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %err, "cannot remove folder");
        }
    }
}

fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    // Rename fails across filesystems; fall back to copy and delete
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)?;
    std::fs::remove_file(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::notify::{testing, Notify};
    use crate::store::{FieldDefn, FieldValue, MemoryDriver};

    fn people_fields() -> Vec<FieldDefn> {
        vec![
            FieldDefn::new("id", FieldType::Integer),
            FieldDefn::new("name", FieldType::String),
        ]
    }

    fn dataset(dir: &Path) -> (Arc<Dataset>, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        let dataset = Dataset::create(
            &dir.join("data.ngst"),
            Arc::new(MemoryDriver::database()),
            Settings::default(),
            Arc::clone(&notify),
        )
        .unwrap();
        (dataset, notify)
    }

    fn table_with_log(dataset: &Arc<Dataset>) -> Arc<Table> {
        let table = dataset
            .create_table("t", &people_fields(), &Options::new(), &Progress::default())
            .unwrap();
        table
            .set_property(LOG_EDIT_HISTORY_KEY, "ON", NG_ADDITIONS_KEY)
            .unwrap();
        table
    }

    fn insert(table: &Table, name: &str) -> i64 {
        let mut f = table.create_feature();
        f.set_field(1, name);
        table.insert_feature(&mut f, true).unwrap();
        f.fid.unwrap()
    }

    #[test]
    fn insert_then_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, notify) = dataset(dir.path());
        let events = testing::recorder(&notify);
        let table = dataset
            .create_table("T", &people_fields(), &Options::new(), &Progress::default())
            .unwrap();

        let mut f1 = table.create_feature();
        assert_eq!(f1.fid, None);
        f1.set_field(1, "x");
        table.insert_feature(&mut f1, true).unwrap();
        assert_eq!(table.feature_count(), 1);

        let fid = f1.fid.unwrap();
        let folder = table.attachments_path().unwrap().join(fid.to_string());
        std::fs::create_dir_all(&folder).unwrap();

        table.delete_feature(fid, true).unwrap();
        assert_eq!(table.feature_count(), 0);
        assert!(!folder.exists());
        assert!(table.delete_feature(fid, true).is_err());

        let codes: Vec<ChangeCode> = events.lock().iter().map(|(_, c)| *c).collect();
        assert!(codes.contains(&ChangeCode::CreateFeature));
        assert!(codes.contains(&ChangeCode::DeleteFeature));
        assert!(events
            .lock()
            .iter()
            .any(|(uri, _)| uri.ends_with(&format!("/T#{}", fid))));
    }

    #[test]
    fn fields_default_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = dataset
            .create_table("t", &people_fields(), &Options::new(), &Progress::default())
            .unwrap();

        let fields = table.fields();
        assert_eq!(fields.len(), table.schema().unwrap().fields.len());
        assert!(fields.iter().all(|f| f.alias == f.name && f.original_name == f.name));

        table
            .set_property("FIELD_1_ALIAS", "Full name", NG_ADDITIONS_KEY)
            .unwrap();
        assert_eq!(table.fields()[1].alias, "Full name");
    }

    #[test]
    fn create_delete_feature_leaves_no_log() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = table_with_log(&dataset);

        let kept = insert(&table, "kept");
        let fid = insert(&table, "gone");
        table.delete_feature(fid, true).unwrap();

        let ops = table.edit_operations();
        assert!(ops.iter().all(|op| op.fid != fid));
        assert_eq!(
            ops,
            vec![EditOperation {
                fid: kept,
                aid: NOT_FOUND,
                code: ChangeCode::CreateFeature
            }]
        );
    }

    #[test]
    fn change_after_create_is_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = table_with_log(&dataset);

        let fid = insert(&table, "a");
        let mut f = table.get_feature(fid).unwrap();
        f.set_field(1, "b");
        table.update_feature(&f, true).unwrap();
        table.update_feature(&f, true).unwrap();
        assert_eq!(table.edit_operations().len(), 1);

        // Synced: the log was consumed, so a change is recorded once
        for op in table.edit_operations() {
            table.delete_edit_operation(&op);
        }
        table.update_feature(&f, true).unwrap();
        table.update_feature(&f, true).unwrap();
        let ops = table.edit_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, ChangeCode::ChangeFeature);

        table.delete_feature(fid, true).unwrap();
        let ops = table.edit_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, ChangeCode::DeleteFeature);
    }

    #[test]
    fn attachment_create_delete_leaves_no_log() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = table_with_log(&dataset);
        let fid = insert(&table, "a");
        for op in table.edit_operations() {
            table.delete_edit_operation(&op);
        }

        let src = dir.path().join("photo.jpg");
        std::fs::write(&src, b"jpeg").unwrap();
        let aid = table
            .add_attachment(fid, "photo.jpg", "front", &src, &Options::new(), true)
            .unwrap();
        assert!(src.exists());

        let listed = table.attachments(fid);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "photo.jpg");
        assert_eq!(listed[0].size, 4);
        assert!(listed[0].path.ends_with(format!("t/{}/{}", fid, aid)));

        assert!(table.delete_attachment(aid, true));
        assert!(table.attachments(fid).is_empty());
        assert!(table.edit_operations().iter().all(|op| op.aid != aid));
        assert!(table.edit_operations().is_empty());
    }

    #[test]
    fn attachment_move_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = table_with_log(&dataset);
        let fid = insert(&table, "a");
        for op in table.edit_operations() {
            table.delete_edit_operation(&op);
        }

        let src = dir.path().join("note.txt");
        std::fs::write(&src, b"hello").unwrap();
        let aid = table
            .add_attachment(
                fid,
                "note.txt",
                "",
                &src,
                &Options::new().with(options::MOVE, "YES"),
                false,
            )
            .unwrap();
        assert!(!src.exists());

        assert!(table.update_attachment(aid, None, Some("memo"), true));
        assert_eq!(table.attachments(fid)[0].description, "memo");
        assert!(table.update_attachment(aid, Some("n.txt"), None, true));
        let ops = table.edit_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, ChangeCode::ChangeAttachment);

        // Deleting a changed attachment rewrites the entry in place
        assert!(table.delete_attachment(aid, true));
        let ops = table.edit_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, ChangeCode::DeleteAttachment);
        assert!(!table.update_attachment(aid, None, Some("x"), false));
    }

    #[test]
    fn delete_all_supersedes_log() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, notify) = dataset(dir.path());
        let table = table_with_log(&dataset);
        insert(&table, "a");
        insert(&table, "b");
        let events = testing::recorder(&notify);

        table.delete_features(true).unwrap();
        assert_eq!(table.feature_count(), 0);
        let ops = table.edit_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, ChangeCode::DeleteAllFeatures);
        assert_eq!(ops[0].fid, NOT_FOUND);
        let all: Vec<_> = events
            .lock()
            .iter()
            .filter(|(_, c)| *c == ChangeCode::DeleteAllFeatures)
            .cloned()
            .collect();
        assert_eq!(all.len(), 1);

        // The next targeted edit purges the marker
        insert(&table, "c");
        let ops = table.edit_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, ChangeCode::CreateFeature);
    }

    #[test]
    fn switching_log_off_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = table_with_log(&dataset);
        insert(&table, "a");
        assert_eq!(table.edit_operations().len(), 1);

        table
            .set_property(LOG_EDIT_HISTORY_KEY, "OFF", NG_ADDITIONS_KEY)
            .unwrap();
        assert!(table.edit_operations().is_empty());
        insert(&table, "b");
        assert!(table.edit_operations().is_empty());
    }

    #[test]
    fn copy_rows_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let src = dataset
            .create_table("src", &people_fields(), &Options::new(), &Progress::default())
            .unwrap();
        for name in ["a", "b", "c"] {
            let mut f = src.create_feature();
            f.set_field(0, 1);
            f.set_field(1, name);
            src.insert_feature(&mut f, false).unwrap();
        }
        let dst = dataset
            .create_table("dst", &people_fields(), &Options::new(), &Progress::default())
            .unwrap();

        dst.copy_rows(&src, &[1, 0], &Progress::default()).unwrap();
        assert_eq!(dst.feature_count(), 3);
        let first = &dst.features().unwrap()[0];
        assert_eq!(first.field(0), &FieldValue::from("a"));

        let cancel = Progress::new(|_, complete, _| complete < 0.3);
        let err = dst.copy_rows(&src, &[0, 1], &cancel).unwrap_err();
        assert!(matches!(err, GeoStoreError::Canceled));
        assert_eq!(dst.feature_count(), 4);
    }

    #[test]
    fn destroy_removes_side_tables() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = dataset(dir.path());
        let table = table_with_log(&dataset);
        let fid = insert(&table, "a");
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"1").unwrap();
        table
            .add_attachment(fid, "a.bin", "", &src, &Options::new(), true)
            .unwrap();
        let folder = table.attachments_path().unwrap();
        assert!(folder.exists());

        assert!(table.can_destroy());
        table.destroy().unwrap();
        assert!(dataset.get_child("t").is_none());
        assert!(dataset.get_edit_history_table("t").is_none());
        assert!(dataset.get_attachments_table("t").is_none());
        assert!(!folder.exists());
        assert!(table.properties(NG_ADDITIONS_KEY).is_empty());
    }
}
