//! Cache Key Derivation
//!
//! Deterministic keys of the form `class:operation:subject:hash`, where the
//! hash covers every component plus the canonicalized parameter set.
//!
//! Parameters are canonicalized by a recursive key sort before hashing, so
//! `{"w": 800, "h": 600}` and `{"h": 600, "w": 800}` produce the same key.
//! The hash is the first 64 bits of a SHA-256 digest, rendered as 16 hex
//! characters. No salt is involved, so keys are stable across restarts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of digest bytes kept in the key token (64 bits)
const HASH_BYTES: usize = 8;

// =============================================================================
// Workload Class
// =============================================================================

/// Category of producer a cached result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    /// Document transformations (merge, split, compress, convert)
    Doc,
    /// Image transformations (resize, convert, optimize)
    Image,
    /// Video transformations (compress, convert, trim)
    Video,
}

impl WorkloadClass {
    /// Every workload class, in table order
    pub const ALL: [WorkloadClass; 3] = [WorkloadClass::Doc, WorkloadClass::Image, WorkloadClass::Video];

    /// Key segment for this class
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Doc => "doc",
            WorkloadClass::Image => "image",
            WorkloadClass::Video => "video",
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "doc" => Ok(WorkloadClass::Doc),
            "image" => Ok(WorkloadClass::Image),
            "video" => Ok(WorkloadClass::Video),
            other => Err(Error::UnknownWorkloadClass(other.to_string())),
        }
    }
}

// =============================================================================
// Cache Key
// =============================================================================

/// Opaque cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-formed key (e.g. one returned by a remote scan)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Workload class segment, if the key was built by [`KeyCodec`]
    pub fn class(&self) -> Option<WorkloadClass> {
        self.segment(0).and_then(|s| s.parse().ok())
    }

    /// Operation segment
    pub fn operation(&self) -> Option<&str> {
        self.segment(1)
    }

    /// Subject id segment
    pub fn subject(&self) -> Option<&str> {
        // Subject ids may themselves contain ':', the hash is always last
        let rest = self.0.splitn(3, ':').nth(2)?;
        let (subject, _hash) = rest.rsplit_once(':')?;
        Some(subject)
    }

    fn segment(&self, idx: usize) -> Option<&str> {
        self.0.split(':').nth(idx)
    }

    /// Consume into the inner string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Key Codec
// =============================================================================

/// Derives cache keys from logical requests
pub struct KeyCodec;

impl KeyCodec {
    /// Build the key for `operation` applied to `subject` with `params`.
    ///
    /// Fails with [`Error::UnencodableParameters`] when `params` cannot be
    /// represented as JSON (e.g. a map with non-string keys).
    pub fn build_key<P: Serialize + ?Sized>(
        class: WorkloadClass,
        operation: &str,
        subject: &str,
        params: &P,
    ) -> Result<CacheKey> {
        let value = serde_json::to_value(params)
            .map_err(|e| Error::UnencodableParameters(e.to_string()))?;

        let mut canonical = String::new();
        write_canonical(&value, &mut canonical)?;

        let mut hasher = Sha256::new();
        hasher.update(class.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();

        Ok(CacheKey(format!(
            "{}:{}:{}:{}",
            class.as_str(),
            operation,
            subject,
            hex_prefix(&digest, HASH_BYTES)
        )))
    }

    /// Canonical JSON rendering of `params` (object keys sorted at every depth)
    pub fn canonicalize<P: Serialize + ?Sized>(params: &P) -> Result<String> {
        let value = serde_json::to_value(params)
            .map_err(|e| Error::UnencodableParameters(e.to_string()))?;
        let mut out = String::new();
        write_canonical(&value, &mut out)?;
        Ok(out)
    }

    /// Glob patterns for records related to a subject.
    ///
    /// Used by cascade invalidation: metadata, job status, failed-job
    /// markers and every cached result derived from the subject.
    pub fn related_patterns(subject: &str) -> Vec<String> {
        vec![
            format!("file:metadata:{}", subject),
            format!("processing:job:{}", subject),
            format!("processing:{}:*", subject),
            format!("*:*:{}:*", subject),
        ]
    }

    /// Pattern covering every result of a workload class
    pub fn class_pattern(class: WorkloadClass) -> String {
        format!("{}:*:*:*", class.as_str())
    }

    /// Pattern covering every result of one operation
    pub fn operation_pattern(class: WorkloadClass, operation: &str) -> String {
        format!("{}:{}:*:*", class.as_str(), operation)
    }

    /// Key of a usage record
    pub fn usage_key(class: WorkloadClass, operation: &str) -> String {
        format!("usage:{}:{}", class.as_str(), operation)
    }
}

/// Serialize with object keys sorted at every level.
///
/// Independent of serde_json's map ordering features so the output never
/// depends on which features other crates in the build enable.
fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                if let Some(v) = map.get(k.as_str()) {
                    write_canonical(v, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{:02x}", b))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_key_shape() {
        let key = KeyCodec::build_key(
            WorkloadClass::Image,
            "resize",
            "file-42",
            &json!({"width": 800, "height": 600}),
        )
        .unwrap();

        let parts: Vec<&str> = key.as_str().split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "image");
        assert_eq!(parts[1], "resize");
        assert_eq!(parts[2], "file-42");
        assert_eq!(parts[3].len(), HASH_BYTES * 2);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_accessors() {
        let key = KeyCodec::build_key(WorkloadClass::Doc, "merge", "a:b", &json!({})).unwrap();
        assert_eq!(key.class(), Some(WorkloadClass::Doc));
        assert_eq!(key.operation(), Some("merge"));
        assert_eq!(key.subject(), Some("a:b"));
    }

    #[test]
    fn test_param_order_does_not_matter() {
        let a = KeyCodec::build_key(
            WorkloadClass::Image,
            "resize",
            "s",
            &json!({"width": 800, "height": 600, "opts": {"b": 1, "a": [1, {"y": 2, "x": 1}]}}),
        )
        .unwrap();
        let b = KeyCodec::build_key(
            WorkloadClass::Image,
            "resize",
            "s",
            &json!({"opts": {"a": [1, {"x": 1, "y": 2}], "b": 1}, "height": 600, "width": 800}),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_inputs_distinct_keys() {
        let base = KeyCodec::build_key(WorkloadClass::Video, "compress", "s", &json!({"q": "low"})).unwrap();
        let other_param =
            KeyCodec::build_key(WorkloadClass::Video, "compress", "s", &json!({"q": "high"})).unwrap();
        let other_subject =
            KeyCodec::build_key(WorkloadClass::Video, "compress", "t", &json!({"q": "low"})).unwrap();
        assert_ne!(base, other_param);
        assert_ne!(base, other_subject);
    }

    #[test]
    fn test_stable_across_calls() {
        let a = KeyCodec::build_key(WorkloadClass::Doc, "split", "s", &json!({"pages": [1, 2]})).unwrap();
        let b = KeyCodec::build_key(WorkloadClass::Doc, "split", "s", &json!({"pages": [1, 2]})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unencodable_parameters() {
        let mut params: HashMap<(u8, u8), u8> = HashMap::new();
        params.insert((1, 2), 3);
        let result = KeyCodec::build_key(WorkloadClass::Doc, "merge", "s", &params);
        assert_matches!(result, Err(Error::UnencodableParameters(_)));
    }

    #[test]
    fn test_unknown_class_is_error() {
        assert_matches!("audio".parse::<WorkloadClass>(), Err(Error::UnknownWorkloadClass(_)));
        assert_eq!("video".parse::<WorkloadClass>().unwrap(), WorkloadClass::Video);
    }

    #[test]
    fn test_related_patterns() {
        let patterns = KeyCodec::related_patterns("f1");
        assert!(patterns.contains(&"file:metadata:f1".to_string()));
        assert!(patterns.contains(&"processing:job:f1".to_string()));
        assert!(patterns.contains(&"*:*:f1:*".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Insertion order of a parameter map never changes the key.
        #[test]
        fn prop_key_independent_of_insertion_order(
            entries in prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..8),
        ) {
            let render = |pairs: Vec<(&String, &i32)>| {
                let body: Vec<String> = pairs
                    .into_iter()
                    .map(|(k, v)| format!("\"{}\":{}", k, v))
                    .collect();
                format!("{{{}}}", body.join(","))
            };
            let forward: Value = serde_json::from_str(&render(entries.iter().collect()))?;
            let reverse: Value = serde_json::from_str(&render(entries.iter().rev().collect()))?;

            let a = KeyCodec::build_key(WorkloadClass::Doc, "op", "s", &forward)?;
            let b = KeyCodec::build_key(WorkloadClass::Doc, "op", "s", &reverse)?;
            let c = KeyCodec::build_key(WorkloadClass::Doc, "op", "s", &entries)?;
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a, c);
        }

        /// Different subjects never share a key.
        #[test]
        fn prop_subject_changes_key(a in "[a-z0-9]{1,12}", b in "[a-z0-9]{1,12}") {
            prop_assume!(a != b);
            let ka = KeyCodec::build_key(WorkloadClass::Image, "resize", &a, &json!({}))?;
            let kb = KeyCodec::build_key(WorkloadClass::Image, "resize", &b, &json!({}))?;
            prop_assert_ne!(ka, kb);
        }
    }
}
