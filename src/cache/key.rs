//! Request key derivation.
//!
//! Parameters are collected into a sorted map before serialization, so two
//! semantically-equal parameter sets always produce the same key no matter
//! in which order a call site supplied them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A single canonical request parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Absent / `None` parameter. Kept in the key rather than skipped.
    Omitted,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn float(v: f64) -> Self {
        if !v.is_finite() {
            return ParamValue::Text(v.to_string());
        }
        if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            // also folds -0.0 into 0
            return ParamValue::Int(v as i64);
        }
        ParamValue::Float(v)
    }

    fn readable(&self) -> String {
        match self {
            ParamValue::Omitted => "~".to_string(),
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Text(s) => format!("'{}'", escape(s)),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}
impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}
impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}
impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v.into())
    }
}
impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::float(v)
    }
}
impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}
impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}
impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Omitted)
    }
}

fn escape(s: &str) -> String {
    s.replace('%', "%25")
        .replace('&', "%26")
        .replace('=', "%3D")
        .replace('~', "%7E")
        .replace('\'', "%27")
}

/// Canonical, order-independent parameter set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalParams {
    params: BTreeMap<String, ParamValue>,
}

impl CanonicalParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Normalized JSON form, the input to the hash.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_default()
    }

    /// Normalized `k=v&k=v` form for readable keys. Text values are quoted,
    /// so `'1'` and `1` stay apart, and `~` marks an omitted value.
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), v.readable()))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for CanonicalParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = CanonicalParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Pure key derivation: SHA-256 over the canonical JSON, lowercase hex.
pub fn derive_key(params: &CanonicalParams) -> String {
    sha256_hex(params.to_canonical_json().as_bytes())
}

/// Salted variant of [`derive_key`]: the salt is length-prefixed ahead of the
/// canonical JSON and never enters the parameter map.
pub fn derive_salted_key(salt: &str, params: &CanonicalParams) -> String {
    let input = format!("{}:{}{}", salt.len(), salt, params.to_canonical_json());
    sha256_hex(input.as_bytes())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A derived key, scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    namespace: String,
    key: String,
}

impl RequestKey {
    pub fn new(namespace: impl Into<String>, id: impl AsRef<str>) -> Self {
        let namespace = namespace.into();
        let key = format!("{}:{}", namespace, id.as_ref());
        Self { namespace, key }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFormat {
    /// Fixed-length SHA-256 hex id.
    #[default]
    Hashed,
    /// The normalized parameter string itself.
    Readable,
}

/// Derives [`RequestKey`]s from canonical parameters.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    format: KeyFormat,
    salt: Option<String>,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: KeyFormat) -> Self {
        self.format = format;
        self
    }

    /// Rotating the salt invalidates every previously derived key.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn derive(&self, namespace: &str, params: &CanonicalParams) -> RequestKey {
        let id = match (self.format, self.salt.as_deref()) {
            (KeyFormat::Hashed, None) => derive_key(params),
            (KeyFormat::Hashed, Some(salt)) => derive_salted_key(salt, params),
            (KeyFormat::Readable, None) => params.to_query_string(),
            (KeyFormat::Readable, Some(salt)) => {
                format!("{}|{}", escape(salt), params.to_query_string())
            }
        };
        RequestKey::new(namespace, id)
    }
}

/// Strongly-typed request descriptor, one per call site.
pub trait RequestDescriptor {
    /// Keyspace for cached responses of this request kind.
    const NAMESPACE: &'static str;

    /// Explicit canonicalization of the request's parameters.
    fn params(&self) -> CanonicalParams;

    /// Parameters identifying the upstream call itself. Defaults to `params()`.
    fn flight_params(&self) -> CanonicalParams {
        self.params()
    }

    fn cache_key(&self, deriver: &KeyDeriver) -> RequestKey {
        deriver.derive(Self::NAMESPACE, &self.params())
    }

    /// Key in the in-flight keyspace, kept apart from the cache keyspace.
    fn flight_key(&self, deriver: &KeyDeriver) -> RequestKey {
        deriver.derive(&format!("flight:{}", Self::NAMESPACE), &self.flight_params())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent() {
        let a = CanonicalParams::new()
            .with("q", "shoes")
            .with("page", 2)
            .with("inStock", true);
        let b: CanonicalParams = vec![
            ("inStock", ParamValue::from(true)),
            ("page", ParamValue::from(2)),
            ("q", ParamValue::from("shoes")),
        ]
        .into_iter()
        .collect();
        assert_eq!(derive_key(&a), derive_key(&b));
        assert_eq!(derive_key(&a).len(), 64);
    }

    #[test]
    fn test_value_change_changes_key() {
        let a = CanonicalParams::new().with("q", "shoes").with("page", 1);
        let b = CanonicalParams::new().with("q", "shoes").with("page", 2);
        assert_ne!(derive_key(&a), derive_key(&b));
    }

    #[test]
    fn test_omitted_is_not_skipped() {
        let none: Option<&str> = None;
        let with_marker = CanonicalParams::new().with("q", "a").with("category", none);
        let without = CanonicalParams::new().with("q", "a");
        assert_eq!(with_marker.get("category"), Some(&ParamValue::Omitted));
        assert_ne!(derive_key(&with_marker), derive_key(&without));

        let empty = CanonicalParams::new().with("q", "a").with("category", "");
        assert_ne!(derive_key(&with_marker), derive_key(&empty));
    }

    #[test]
    fn test_type_tags_prevent_collisions() {
        let text = CanonicalParams::new().with("page", "1");
        let int = CanonicalParams::new().with("page", 1);
        assert_ne!(derive_key(&text), derive_key(&int));
    }

    #[test]
    fn test_float_normalization() {
        assert_eq!(ParamValue::from(2.0), ParamValue::Int(2));
        assert_eq!(ParamValue::from(-0.0), ParamValue::Int(0));
        assert_eq!(ParamValue::from(f64::NAN), ParamValue::Text("NaN".into()));
        assert_eq!(ParamValue::from(0.5), ParamValue::Float(0.5));
    }

    #[test]
    fn test_readable_format_escapes_separators() {
        let deriver = KeyDeriver::new().with_format(KeyFormat::Readable);
        let key = deriver.derive(
            "products",
            &CanonicalParams::new().with("q", "a&b=c").with("page", 3),
        );
        assert_eq!(key.as_str(), "products:page=3&q='a%26b%3Dc'");
        assert_eq!(key.namespace(), "products");
    }

    #[test]
    fn test_readable_format_keeps_values_apart() {
        let deriver = KeyDeriver::new().with_format(KeyFormat::Readable);
        let none: Option<&str> = None;
        let omitted = deriver.derive("n", &CanonicalParams::new().with("c", none));
        let tilde = deriver.derive("n", &CanonicalParams::new().with("c", "~"));
        assert_eq!(omitted.as_str(), "n:c=~");
        assert_eq!(tilde.as_str(), "n:c='%7E'");

        let int = deriver.derive("n", &CanonicalParams::new().with("p", 1));
        let text = deriver.derive("n", &CanonicalParams::new().with("p", "1"));
        assert_ne!(int, text);

        let flag = deriver.derive("n", &CanonicalParams::new().with("f", true));
        let word = deriver.derive("n", &CanonicalParams::new().with("f", "true"));
        assert_ne!(flag, word);

        let quoted = deriver.derive("n", &CanonicalParams::new().with("q", "'x'"));
        let plain = deriver.derive("n", &CanonicalParams::new().with("q", "x"));
        assert_ne!(quoted, plain);
    }

    #[test]
    fn test_salt_changes_keys() {
        let params = CanonicalParams::new().with("id", "sku-1");
        let plain = KeyDeriver::new().derive("product", &params);
        let salted = KeyDeriver::new().with_salt("v2").derive("product", &params);
        assert_ne!(plain, salted);
        assert_eq!(salted.namespace(), "product");
    }

    #[test]
    fn test_salt_does_not_overwrite_params() {
        let own = CanonicalParams::new().with("id", "sku-1").with("__salt", "v2");
        let plain = CanonicalParams::new().with("id", "sku-1");
        for format in [KeyFormat::Hashed, KeyFormat::Readable] {
            let deriver = KeyDeriver::new().with_format(format).with_salt("v2");
            assert_ne!(deriver.derive("product", &own), deriver.derive("product", &plain));
        }
    }

    struct Lookup {
        id: &'static str,
    }

    impl RequestDescriptor for Lookup {
        const NAMESPACE: &'static str = "lookup";
        fn params(&self) -> CanonicalParams {
            CanonicalParams::new().with("id", self.id)
        }
    }

    #[test]
    fn test_cache_and_flight_keyspaces_are_distinct() {
        let deriver = KeyDeriver::new();
        let req = Lookup { id: "sku-9" };
        let cache = req.cache_key(&deriver);
        let flight = req.flight_key(&deriver);
        assert_ne!(cache, flight);
        assert_eq!(flight.namespace(), "flight:lookup");
    }
}
