//! Data requests
//!
//! A [`Request`] is a string-keyed map that addresses one unit of data in the
//! pipeline. Its canonical string form (`KEY1=value1;KEY2=value2`, keys
//! sorted) is what the memory manager and the scheduler use as identity, so
//! the map is kept in a `BTreeMap` and the string is rebuilt lazily.
//!
//! Values are stored as strings; the typed accessors decode them and fall back
//! to a documented default when a key is missing or malformed.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Separator between `key=value` pairs.
const PAIR_SEPARATOR: char = ';';

/// Separator between key and value.
const KEY_VALUE_SEPARATOR: char = '=';

/// Separator used inside vector and set values.
const LIST_SEPARATOR: char = '/';

/// Well-known request keys.
///
/// Pipeline code should refer to keys through these names rather than string
/// literals so that a typo is a compile error.
pub mod keys {
    /// Forecast initialisation (base) time.
    pub const INIT_TIME: &str = "INIT_TIME";
    /// Forecast valid time.
    pub const VALID_TIME: &str = "VALID_TIME";
    /// Variable name, e.g. `T`.
    pub const VARIABLE: &str = "VARIABLE";
    /// Vertical level type, e.g. `HYBRID`.
    pub const LEVELTYPE: &str = "LEVELTYPE";
    /// Single ensemble member.
    pub const MEMBER: &str = "MEMBER";
    /// Set of ensemble members.
    pub const MEMBERS: &str = "MEMBERS";
    /// Standard deviation of the smoothing kernel, in grid points.
    pub const SMOOTH_STDDEV: &str = "SMOOTH_STDDEV";
    /// Marks a task that only forwards a request to a pass-through source.
    pub const PASS: &str = "PASS";
}

/// Three-component vector value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A value that can be stored in a [`Request`].
///
/// Returning `None` means "store nothing" (used for empty member sets).
pub trait RequestValue {
    fn encode(&self) -> Option<String>;
}

impl RequestValue for &str {
    fn encode(&self) -> Option<String> {
        Some((*self).to_string())
    }
}

impl RequestValue for String {
    fn encode(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl RequestValue for &String {
    fn encode(&self) -> Option<String> {
        Some((*self).clone())
    }
}

macro_rules! display_value {
    ($($ty:ty),*) => {
        $(
            impl RequestValue for $ty {
                fn encode(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

display_value!(i32, i64, u32, u64, usize, f32, f64, bool);

impl RequestValue for DateTime<Utc> {
    fn encode(&self) -> Option<String> {
        Some(self.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

impl RequestValue for Vec3 {
    fn encode(&self) -> Option<String> {
        Some(format!("{}/{}/{}", self.x, self.y, self.z))
    }
}

impl RequestValue for BTreeSet<u32> {
    fn encode(&self) -> Option<String> {
        encode_uint_set(self.iter().copied())
    }
}

impl RequestValue for HashSet<u32> {
    fn encode(&self) -> Option<String> {
        // HashSet iteration order is arbitrary; sort for a stable cache key.
        let sorted: BTreeSet<u32> = self.iter().copied().collect();
        encode_uint_set(sorted.into_iter())
    }
}

fn encode_uint_set(sorted: impl Iterator<Item = u32>) -> Option<String> {
    let parts: Vec<String> = sorted.map(|v| v.to_string()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// String-keyed request map with a cached canonical string form.
#[derive(Clone, Default)]
pub struct Request {
    map: BTreeMap<String, String>,
    canonical: OnceCell<String>,
}

impl Request {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a canonical request string.
    ///
    /// Empty pairs are skipped; a pair without `=` becomes a key with an
    /// empty value. Parsing never fails.
    pub fn parse(s: &str) -> Self {
        let mut map = BTreeMap::new();
        for pair in s.split(PAIR_SEPARATOR).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(KEY_VALUE_SEPARATOR)
                .unwrap_or((pair, ""));
            map.insert(key.to_string(), value.to_string());
        }
        Self {
            map,
            canonical: OnceCell::new(),
        }
    }

    /// Canonical string form, regenerated only after a mutation.
    pub fn request(&self) -> &str {
        self.canonical.get_or_init(|| {
            self.map
                .iter()
                .map(|(k, v)| format!("{}{}{}", k, KEY_VALUE_SEPARATOR, v))
                .collect::<Vec<_>>()
                .join(";")
        })
    }

    fn touch(&mut self) {
        self.canonical = OnceCell::new();
    }

    /// Insert a value. Empty uint sets are not stored.
    pub fn insert(&mut self, key: impl Into<String>, value: impl RequestValue) {
        if let Some(encoded) = value.encode() {
            self.map.insert(key.into(), encoded);
            self.touch();
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl RequestValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keys in canonical (sorted) order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn contains_all<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        keys.iter().all(|k| self.map.contains_key(k.as_ref()))
    }

    /// Remove a key, returning whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    /// Keep only the listed keys.
    pub fn remove_all_keys_except<S: AsRef<str>>(&mut self, keep: &[S]) {
        self.map
            .retain(|key, _| keep.iter().any(|k| k.as_ref() == key.as_str()));
        self.touch();
    }

    /// Remove every listed key.
    pub fn remove_all<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.map.remove(key.as_ref());
        }
        self.touch();
    }

    /// Prepend `prefix` to every key.
    pub fn add_key_prefix(&mut self, prefix: &str) {
        let map = std::mem::take(&mut self.map);
        self.map = map
            .into_iter()
            .map(|(k, v)| (format!("{}{}", prefix, k), v))
            .collect();
        self.touch();
    }

    /// Strip `prefix` from every key that carries it; other keys are kept.
    pub fn remove_key_prefix(&mut self, prefix: &str) {
        let map = std::mem::take(&mut self.map);
        self.map = map
            .into_iter()
            .map(|(k, v)| match k.strip_prefix(prefix) {
                Some(stripped) => (stripped.to_string(), v),
                None => (k, v),
            })
            .collect();
        self.touch();
    }

    /// New request with only the keys carrying `prefix`, prefix stripped.
    pub fn sub_request(&self, prefix: &str) -> Request {
        let map = self
            .map
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|s| (s.to_string(), v.clone())))
            .collect();
        Request {
            map,
            canonical: OnceCell::new(),
        }
    }

    /// Merge `other` into this request; values from `other` win.
    pub fn unite(&mut self, other: &Request) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
        self.touch();
    }

    /// Raw string value, empty if absent.
    pub fn value(&self, key: &str) -> &str {
        self.map.get(key).map(String::as_str).unwrap_or("")
    }

    /// Integer value, 0 if absent or malformed.
    pub fn int_value(&self, key: &str) -> i64 {
        self.value(key).trim().parse().unwrap_or(0)
    }

    /// Float value, 0.0 if absent or malformed.
    pub fn float_value(&self, key: &str) -> f32 {
        self.value(key).trim().parse().unwrap_or(0.0)
    }

    /// ISO-8601 timestamp, `None` if absent or malformed.
    pub fn time_value(&self, key: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.value(key))
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// `x/y/z` vector, zero vector if absent or malformed.
    pub fn vec3_value(&self, key: &str) -> Vec3 {
        let parts: Vec<f32> = self
            .value(key)
            .split(LIST_SEPARATOR)
            .map(|p| p.trim().parse::<f32>())
            .collect::<Result<_, _>>()
            .unwrap_or_default();
        match parts.as_slice() {
            [x, y, z, ..] => Vec3::new(*x, *y, *z),
            _ => Vec3::default(),
        }
    }

    /// Unsigned-int set, empty if absent. Unparseable entries are skipped.
    pub fn uint_set_value(&self, key: &str) -> BTreeSet<u32> {
        self.value(key)
            .split(LIST_SEPARATOR)
            .filter_map(|p| p.trim().parse().ok())
            .collect()
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.map.hash(state);
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({:?})", self.request())
    }
}

impl FromStr for Request {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for Request {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}
