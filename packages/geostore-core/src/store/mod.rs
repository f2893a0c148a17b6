//! Feature store adapter.
//!
//! The dataset layer talks to its persistence engine only through the
//! [`FeatureStore`] and [`StoreDriver`] traits. [`memory::MemoryStore`] is the
//! bundled implementation.

use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::geometry::GeometryType;
use crate::options::Options;

pub mod memory;

pub use memory::{MemoryDriver, MemoryStore};

/// Field name that addresses the feature id in filters and SQL.
pub const FID_FIELD: &str = "fid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Integer64,
    Real,
    String,
    Date,
    Time,
    DateTime,
    Binary,
    IntegerList,
    RealList,
    StringList,
    Integer64List,
}

pub fn field_type_from_name(name: &str) -> Option<FieldType> {
    let ty = match name.trim().to_ascii_uppercase().as_str() {
        "INTEGER" => FieldType::Integer,
        "INTEGER_LIST" => FieldType::IntegerList,
        "REAL" => FieldType::Real,
        "REAL_LIST" => FieldType::RealList,
        "STRING" => FieldType::String,
        "STRING_LIST" => FieldType::StringList,
        "BINARY" => FieldType::Binary,
        "DATE" => FieldType::Date,
        "TIME" => FieldType::Time,
        "DATE_TIME" => FieldType::DateTime,
        "INTEGER64" => FieldType::Integer64,
        "INTEGER64_LIST" => FieldType::Integer64List,
        _ => return None,
    };
    Some(ty)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefn {
    pub name: String,
    pub field_type: FieldType,
    /// Maximum width, 0 for unlimited.
    pub width: u32,
}

impl FieldDefn {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            width: 0,
        }
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    String(String),
    Binary(Vec<u8>),
    DateTime(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Real(v) => Some(*v as i64),
            FieldValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Real(v) => Some(*v),
            FieldValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) | FieldValue::DateTime(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Text form used for LIKE matching and loose comparisons.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Real(v) => v.to_string(),
            FieldValue::String(s) | FieldValue::DateTime(s) => s.clone(),
            FieldValue::Binary(b) => format!("{} bytes", b.len()),
        }
    }

    /// SQL-style equality: numbers compare numerically across int and real.
    pub fn loose_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Null, _) | (_, FieldValue::Null) => false,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a == b,
            (FieldValue::Integer(_) | FieldValue::Real(_), FieldValue::Integer(_) | FieldValue::Real(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                    _ => false,
                }
            }
            (FieldValue::Binary(a), FieldValue::Binary(b)) => a == b,
            _ => self.to_text() == other.to_text(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Binary(v)
    }
}

/// One row. `fid == None` until the store assigns an id on insert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Feature {
    pub fid: Option<i64>,
    pub fields: Vec<FieldValue>,
    pub geometry: Option<Geometry<f64>>,
}

impl Feature {
    pub fn new(field_count: usize) -> Self {
        Self {
            fid: None,
            fields: vec![FieldValue::Null; field_count],
            geometry: None,
        }
    }

    pub fn field(&self, index: usize) -> &FieldValue {
        self.fields.get(index).unwrap_or(&FieldValue::Null)
    }

    pub fn set_field(&mut self, index: usize, value: impl Into<FieldValue>) {
        if index >= self.fields.len() {
            self.fields.resize(index + 1, FieldValue::Null);
        }
        self.fields[index] = value.into();
    }

    /// Copy `src[i]` into `self[map[i]]` for every non-negative `map[i]`.
    pub fn set_fields_from(&mut self, src: &Feature, field_map: &[i32]) {
        for (i, dst) in field_map.iter().enumerate() {
            if *dst < 0 {
                continue;
            }
            if let Some(value) = src.fields.get(i) {
                self.set_field(*dst as usize, value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSchema {
    pub name: String,
    /// `None` for attribute-only tables.
    pub geometry_type: Option<GeometryType>,
    pub fields: Vec<FieldDefn>,
    pub srs: Option<u32>,
}

impl LayerSchema {
    pub fn table(name: impl Into<String>, fields: Vec<FieldDefn>) -> Self {
        Self {
            name: name.into(),
            geometry_type: None,
            fields,
            srs: None,
        }
    }

    pub fn feature_class(
        name: impl Into<String>,
        geometry_type: GeometryType,
        srs: Option<u32>,
        fields: Vec<FieldDefn>,
    ) -> Self {
        Self {
            name: name.into(),
            geometry_type: Some(geometry_type),
            fields,
            srs,
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    /// SQL LIKE with `%` wildcards, ASCII case-insensitive.
    Like,
}

/// Conjunction of simple attribute clauses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeFilter {
    clauses: Vec<(String, Cmp, FieldValue)>,
}

impl AttributeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(field: &str, value: impl Into<FieldValue>) -> Self {
        Self::new().and(field, Cmp::Eq, value)
    }

    pub fn like(field: &str, pattern: &str) -> Self {
        Self::new().and(field, Cmp::Like, pattern)
    }

    pub fn and(mut self, field: &str, cmp: Cmp, value: impl Into<FieldValue>) -> Self {
        self.clauses.push((field.to_string(), cmp, value.into()));
        self
    }

    pub fn and_eq(self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.and(field, Cmp::Eq, value)
    }

    pub fn clauses(&self) -> &[(String, Cmp, FieldValue)] {
        &self.clauses
    }

    pub fn matches(&self, schema: &LayerSchema, feature: &Feature) -> bool {
        self.clauses.iter().all(|(field, cmp, value)| {
            let actual = if field.eq_ignore_ascii_case(FID_FIELD) {
                feature.fid.map(FieldValue::Integer).unwrap_or_default()
            } else {
                match schema.field_index(field) {
                    Some(index) => feature.field(index).clone(),
                    None => return false,
                }
            };
            match cmp {
                Cmp::Eq => actual.loose_eq(value),
                Cmp::Ne => !actual.is_null() && !actual.loose_eq(value),
                Cmp::Like => like_match(&actual.to_text(), &value.to_text()),
            }
        })
    }
}

/// `%` matches any run of characters, `_` a single one.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_ascii_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_ascii_lowercase().chars().collect();

    // Iterative wildcard match with backtracking to the last '%'
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

/// Rows produced by a SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub schema: LayerSchema,
    pub features: Vec<Feature>,
}

/// Persistence engine consumed by datasets.
///
/// Every method takes `&self`; implementations synchronise internally. Errors
/// carry the store's own message text.
pub trait FeatureStore: Send + Sync {
    fn path(&self) -> Option<&Path>;
    fn is_read_only(&self) -> bool;

    /// Layer names in creation order.
    fn layer_names(&self) -> Vec<String>;
    fn layer_schema(&self, layer: &str) -> Option<LayerSchema>;
    fn has_layer(&self, layer: &str) -> bool {
        self.layer_schema(layer).is_some()
    }
    fn create_layer(&self, schema: &LayerSchema, options: &Options) -> Result<()>;
    fn delete_layer(&self, layer: &str) -> Result<()>;
    fn create_field(&self, layer: &str, field: &FieldDefn) -> Result<()>;

    /// Insert and assign the feature id.
    fn create_feature(&self, layer: &str, feature: &mut Feature) -> Result<i64>;
    fn set_feature(&self, layer: &str, feature: &Feature) -> Result<()>;
    fn get_feature(&self, layer: &str, fid: i64) -> Option<Feature>;
    fn delete_feature(&self, layer: &str, fid: i64) -> Result<()>;
    /// Matching features in natural scan order.
    fn features(&self, layer: &str, filter: Option<&AttributeFilter>) -> Result<Vec<Feature>>;
    fn feature_count(&self, layer: &str) -> Result<u64>;
    fn delete_where(&self, layer: &str, filter: Option<&AttributeFilter>) -> Result<usize>;

    fn execute_sql(&self, statement: &str, dialect: &str) -> Result<Option<QueryResult>>;

    fn metadata_item(&self, domain: &str, key: &str) -> Option<String>;
    fn metadata(&self, domain: &str) -> BTreeMap<String, String>;
    fn set_metadata_item(&self, domain: &str, key: &str, value: &str) -> Result<()>;
    fn clear_metadata(&self, domain: &str) -> Result<()>;

    /// Durability toggle. Disabled during batch operations.
    fn set_journal(&self, enabled: bool) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// Opens and creates stores of one container format.
pub trait StoreDriver: Send + Sync {
    fn name(&self) -> &str;
    /// Database formats keep auxiliary tables in the primary store.
    fn is_database(&self) -> bool;
    fn extension(&self) -> &str;
    fn open(&self, path: &Path, read_only: bool) -> Result<Arc<dyn FeatureStore>>;
    fn create(&self, path: &Path) -> Result<Arc<dyn FeatureStore>>;
}

/// Replace the extension of `path`, the way sibling files are named.
pub(crate) fn reset_extension(path: &Path, extension: &str) -> PathBuf {
    path.with_extension(extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> LayerSchema {
        LayerSchema::table(
            "t",
            vec![
                FieldDefn::new("id", FieldType::Integer),
                FieldDefn::new("name", FieldType::String),
            ],
        )
    }

    #[test]
    fn field_type_names() {
        assert_eq!(field_type_from_name("date_time"), Some(FieldType::DateTime));
        assert_eq!(field_type_from_name("INTEGER64_LIST"), Some(FieldType::Integer64List));
        assert_eq!(field_type_from_name("blob"), None);
    }

    #[test]
    fn field_map_copy_skips_negative() {
        let mut src = Feature::new(3);
        src.set_field(0, 1);
        src.set_field(1, "a");
        src.set_field(2, 2.5);
        let mut dst = Feature::new(2);
        dst.set_fields_from(&src, &[1, -1, 0]);
        assert_eq!(dst.fields[0], FieldValue::Real(2.5));
        assert_eq!(dst.fields[1], FieldValue::Integer(1));
    }

    #[test]
    fn filter_matching() {
        let schema = schema();
        let mut f = Feature::new(2);
        f.fid = Some(7);
        f.set_field(0, 3);
        f.set_field(1, "layer.nga.key");

        assert!(AttributeFilter::eq("fid", 7).matches(&schema, &f));
        assert!(AttributeFilter::eq("ID", 3.0).matches(&schema, &f));
        assert!(AttributeFilter::like("name", "layer.nga.%").matches(&schema, &f));
        assert!(!AttributeFilter::like("name", "other.%").matches(&schema, &f));
        assert!(!AttributeFilter::eq("missing", 1).matches(&schema, &f));
        assert!(AttributeFilter::new()
            .and("id", Cmp::Ne, -1)
            .and_eq("fid", 7)
            .matches(&schema, &f));
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("abc", "a%"));
        assert!(like_match("abc", "%c"));
        assert!(like_match("abc", "a_c"));
        assert!(like_match("ABC", "abc"));
        assert!(!like_match("abc", "b%"));
    }
}
