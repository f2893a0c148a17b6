use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Load and paste option keys
pub const MOVE: &str = "MOVE";
pub const NEW_NAME: &str = "NEW_NAME";
pub const ACCEPT_GEOMETRY: &str = "ACCEPT_GEOMETRY";
pub const FORCE_GEOMETRY_TO_MULTI: &str = "FORCE_GEOMETRY_TO_MULTI";
pub const SKIP_EMPTY_GEOMETRY: &str = "SKIP_EMPTY_GEOMETRY";
pub const SKIP_INVALID_GEOMETRY: &str = "SKIP_INVALID_GEOMETRY";
pub const CREATE_OVERVIEWS_TABLE: &str = "CREATE_OVERVIEWS_TABLE";
pub const CREATE_OVERVIEWS: &str = "CREATE_OVERVIEWS";
pub const ZOOM_LEVELS: &str = "ZOOM_LEVELS";
pub const FORCE: &str = "FORCE";
pub const OVERWRITE: &str = "OVERWRITE";

/// Case-insensitive string key/value options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    values: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut out = Self::new();
        for (key, value) in pairs {
            out.add(key, value);
        }
        out
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values
            .insert(key.into().to_ascii_uppercase(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(&key.to_ascii_uppercase());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn as_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn as_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => matches!(
                value.trim().to_ascii_uppercase().as_str(),
                "YES" | "ON" | "TRUE" | "1"
            ),
            None => default,
        }
    }

    pub fn as_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        let options = Options::from_pairs([("move", "yes"), ("FORCE", "off"), ("x", "1")]);
        assert!(options.as_bool(MOVE, false));
        assert!(!options.as_bool(FORCE, true));
        assert!(options.as_bool("X", false));
        assert!(options.as_bool("missing", true));
    }

    #[test]
    fn string_and_int() {
        let options = Options::new().with(ZOOM_LEVELS, "2,4").with("N", "12");
        assert_eq!(options.as_string(ZOOM_LEVELS, ""), "2,4");
        assert_eq!(options.as_int("n", 0), 12);
        assert_eq!(options.as_int("missing", 7), 7);
    }
}
