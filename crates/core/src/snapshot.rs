//! Observed `{spec, status, annotations}` of one resource, plus canonical
//! serialization used for hashing and diff rendering.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("canonical json encoding failed")]
    Json(#[from] serde_json::Error),
    #[error("canonical yaml encoding failed")]
    Yaml(#[from] serde_yaml::Error),
}

/// The subset of a resource document used for change detection.
///
/// Held as a generic key-value tree; only `spec`, `status` and
/// `metadata.annotations` of the source document are kept. Missing fields are
/// recorded as `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot(Value);

impl ResourceSnapshot {
    pub fn observe(doc: &Value) -> Self {
        let pick = |v: Option<&Value>| v.cloned().unwrap_or(Value::Null);
        let mut map = Map::new();
        map.insert("annotations".into(), pick(doc.get("metadata").and_then(|m| m.get("annotations"))));
        map.insert("spec".into(), pick(doc.get("spec")));
        map.insert("status".into(), pick(doc.get("status")));
        Self(Value::Object(map))
    }

    pub fn spec(&self) -> &Value { self.0.get("spec").unwrap_or(&Value::Null) }
    pub fn status(&self) -> &Value { self.0.get("status").unwrap_or(&Value::Null) }
    pub fn annotations(&self) -> &Value { self.0.get("annotations").unwrap_or(&Value::Null) }

    /// Single annotation value, if present and a string.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).and_then(|v| v.as_str())
    }

    pub fn as_value(&self) -> &Value { &self.0 }

    /// Resolve a dotted path such as `.status.phase` (leading dot optional)
    /// against the snapshot.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.strip_prefix('.').unwrap_or(path);
        if path.is_empty() { return None; }
        path.split('.').try_fold(&self.0, |cur, seg| cur.get(seg))
    }

    /// Resolve every `annotation key -> status path` entry of a status mapping,
    /// skipping paths that do not resolve.
    pub fn mapped_status<'a>(&'a self, mapping: &'a BTreeMap<String, String>) -> BTreeMap<&'a str, &'a Value> {
        mapping
            .iter()
            .filter_map(|(k, path)| self.lookup(path).map(|v| (k.as_str(), v)))
            .collect()
    }

    /// Hex MD5 over the canonical JSON encoding (object keys sorted at every level).
    pub fn content_hash(&self) -> Result<String, SerializationError> {
        let bytes = serde_json::to_vec(&Canonical(&self.0))?;
        Ok(format!("{:x}", md5::compute(bytes)))
    }

    /// Canonical YAML text (sorted keys), the form fed to the diff engine.
    pub fn to_yaml(&self) -> Result<String, SerializationError> {
        Ok(serde_yaml::to_string(&Canonical(&self.0))?)
    }
}

/// Serializes a JSON tree with object keys in lexical order regardless of how the
/// underlying map stores them.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    out.serialize_entry(k, &Canonical(v))?;
                }
                out.end()
            }
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            other => other.serialize(serializer),
        }
    }
}
