//! Reflex core types: object identity, version tokens, change events and errors.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod selector;
pub mod stop;

pub use selector::{Requirement, Selector};
pub use stop::{stop_channel, StopHandle, StopSignal};

/// Error taxonomy shared by every reflex crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The source can no longer resume from the given version token.
    #[error("expired: {0}")]
    Expired(String),
    /// Network/authorization failure talking to the source.
    #[error("transport: {0}")]
    Transport(String),
    /// A single object could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
    #[error("change queue closed")]
    QueueClosed,
    #[error("informer stopped")]
    Stopped,
    #[error("informer already started")]
    AlreadyStarted,
    #[error("index conflict: {0}")]
    IndexConflict(String),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid resource type: {0}")]
    InvalidResourceType(String),
}

impl Error {
    pub fn is_expired(&self) -> bool { matches!(self, Error::Expired(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of an object within one resource type: `namespace/name`, or `name`
/// for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn of<T: Object + ?Sized>(obj: &T) -> Self { Self::new(obj.namespace(), obj.name()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split back into `(namespace, name)`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Opaque version token handed out by List and advanced by Watch.
///
/// Tokens are totally ordered per resource type: a shorter token is older, and
/// equal-length tokens compare bytewise. This matches decimal resource versions
/// without parsing them. The empty token means "unset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.len().cmp(&other.0.len()).then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Anything the cache can hold: named, optionally namespaced, versioned.
pub trait Object: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
    /// Resource version of this object (empty when unknown).
    fn version(&self) -> &str;
    fn labels(&self) -> Option<&BTreeMap<String, String>> { None }
}

/// Group/version/kind of a watched collection, keyed like `v1/ConfigMap` or
/// `apps/v1/Deployment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(Error::InvalidResourceType(format!("{} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

impl FromStr for ResourceType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

/// Schema-less object: identity and metadata pulled out of the raw JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
    /// Seconds since epoch, 0 when absent or unparsable.
    pub creation_ts: i64,
    pub raw: serde_json::Value,
}

impl RawObject {
    /// Decode metadata from a JSON object. Only `metadata.name` is mandatory.
    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| Error::Decode("object missing metadata".into()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Decode("object missing metadata.name".into()))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels = BTreeMap::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() { labels.insert(k.clone(), val.to_string()); }
            }
        }
        Ok(Self { namespace, name, resource_version, labels, creation_ts, raw })
    }

    pub fn kind(&self) -> Option<&str> { self.raw.get("kind").and_then(|v| v.as_str()) }
}

impl Object for RawObject {
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    fn version(&self) -> &str { &self.resource_version }
    fn labels(&self) -> Option<&BTreeMap<String, String>> { Some(&self.labels) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
    Sync,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Sync => "sync",
        }
    }
}

/// A pending change for one key. `Sync` carries the current store entry and
/// means "unchanged, re-confirmed".
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Added(T),
    Updated(T),
    Deleted(T),
    Sync(T),
}

impl<T> ChangeEvent<T> {
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Added(_) => EventKind::Added,
            ChangeEvent::Updated(_) => EventKind::Updated,
            ChangeEvent::Deleted(_) => EventKind::Deleted,
            ChangeEvent::Sync(_) => EventKind::Sync,
        }
    }

    pub fn object(&self) -> &T {
        match self {
            ChangeEvent::Added(o) | ChangeEvent::Updated(o) | ChangeEvent::Deleted(o) | ChangeEvent::Sync(o) => o,
        }
    }
}

pub mod prelude {
    pub use super::{ChangeEvent, Error, EventKind, Object, ObjectKey, RawObject, ResourceType, Result, Selector, StopHandle, StopSignal, Version};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_namespace_and_name() {
        let k = ObjectKey::new(Some("ns"), "a");
        assert_eq!(k.as_str(), "ns/a");
        assert_eq!(k.split(), (Some("ns"), "a"));
        let c = ObjectKey::new(None, "node-1");
        assert_eq!(c.split(), (None, "node-1"));
        assert_eq!(ObjectKey::new(Some(""), "x").as_str(), "x");
    }

    #[test]
    fn version_order_is_numeric_for_decimal_tokens() {
        assert!(Version::from("9") < Version::from("10"));
        assert!(Version::from("100") > Version::from("99"));
        assert!(Version::from("") < Version::from("1"));
        assert_eq!(Version::from("42").cmp(&Version::from("42")), Ordering::Equal);
    }

    #[test]
    fn resource_type_parse() {
        let rt = ResourceType::parse("v1/ConfigMap").unwrap();
        assert_eq!(rt.group, "");
        assert_eq!(rt.key(), "v1/ConfigMap");
        let rt = ResourceType::parse("serving.knative.dev/v1/Revision").unwrap();
        assert_eq!(rt.group, "serving.knative.dev");
        assert!(ResourceType::parse("Widget").is_err());
        assert!(ResourceType::parse("a/b/c/d").is_err());
    }

    #[test]
    fn raw_object_decodes_metadata() {
        let v = serde_json::json!({
            "kind": "ConfigMap",
            "metadata": {
                "name": "a",
                "namespace": "ns",
                "resourceVersion": "17",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "labels": { "app": "web", "tier": "front" }
            }
        });
        let o = RawObject::from_value(v).unwrap();
        assert_eq!(ObjectKey::of(&o).as_str(), "ns/a");
        assert_eq!(o.version(), "17");
        assert_eq!(o.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(o.creation_ts, 1_577_836_800);
        assert_eq!(o.kind(), Some("ConfigMap"));
    }

    #[test]
    fn raw_object_without_name_is_a_decode_error() {
        let err = RawObject::from_value(serde_json::json!({ "metadata": {} })).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        let err = RawObject::from_value(serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
