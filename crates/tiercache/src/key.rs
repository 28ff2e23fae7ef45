//! Canonical cache key construction.
//!
//! A key is a namespace followed by its ordered parts, joined by
//! [`KEY_SEPARATOR`]: `job:analysis|user1|resume1`.
//!
//! Neither namespaces nor parts may contain the separator. That keeps
//! `invalidate_namespace` prefix matching unambiguous: the keys under
//! `(ns, [a])` are exactly `ns|a` and everything starting with `ns|a|`.

use std::fmt;

use crate::error::{CacheError, CacheResult};

/// Separator placed between the namespace and each key part.
pub const KEY_SEPARATOR: char = '|';

/// A single scalar component of a cache key.
///
/// `None` parts are dropped when the key is built, so optional identifiers
/// can be passed straight through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPart(Option<String>);

impl KeyPart {
    /// A part that is skipped when building the key.
    pub const fn none() -> Self {
        Self(None)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(s) => f.write_str(s),
            None => Ok(()),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self(Some(value.to_string()))
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self(Some(value))
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self(Some(value.clone()))
    }
}

macro_rules! key_part_from_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    Self(Some(value.to_string()))
                }
            }
        )*
    };
}

key_part_from_display!(bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_else(KeyPart::none)
    }
}

/// Build a `Vec<KeyPart>` from heterogeneous scalars.
///
/// ```
/// use tiercache::key_parts;
/// let parts = key_parts!["user1", 42u64, None::<&str>];
/// assert_eq!(parts.len(), 3);
/// ```
#[macro_export]
macro_rules! key_parts {
    () => {
        ::std::vec::Vec::<$crate::KeyPart>::new()
    };
    ($($part:expr),+ $(,)?) => {
        vec![$($crate::KeyPart::from($part)),+]
    };
}

/// Build the canonical key for `namespace` and `parts`.
pub fn build_key(namespace: &str, parts: &[KeyPart]) -> CacheResult<String> {
    validate_namespace(namespace)?;

    let mut key = String::with_capacity(namespace.len() + parts.len() * 16);
    key.push_str(namespace);

    for part in parts.iter().filter_map(KeyPart::as_str) {
        if part.contains(KEY_SEPARATOR) {
            return Err(CacheError::configuration(format!(
                "key part '{part}' in namespace '{namespace}' contains the reserved separator '{KEY_SEPARATOR}'"
            )));
        }
        key.push(KEY_SEPARATOR);
        key.push_str(part);
    }

    Ok(key)
}

/// The invalidation prefix of `(namespace, parts)`.
///
/// Identical to [`build_key`]; the keys it covers are the prefix itself and
/// every key starting with `prefix|`.
pub fn key_prefix(namespace: &str, parts: &[KeyPart]) -> CacheResult<String> {
    build_key(namespace, parts)
}

/// Whether `key` equals `base` or lies below it in the key hierarchy.
#[inline]
pub fn is_under(key: &str, base: &str) -> bool {
    match key.strip_prefix(base) {
        Some("") => true,
        Some(rest) => rest.starts_with(KEY_SEPARATOR),
        None => false,
    }
}

fn validate_namespace(namespace: &str) -> CacheResult<()> {
    if namespace.trim().is_empty() {
        return Err(CacheError::configuration("cache namespace is required"));
    }
    if namespace.contains(KEY_SEPARATOR) {
        return Err(CacheError::configuration(format!(
            "namespace '{namespace}' contains the reserved separator '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}
