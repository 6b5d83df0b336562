use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use std::collections::BTreeMap;
use thiserror::Error;

pub const QUOTA_ANNOTATION: &str = "quota";
pub const USAGE_ANNOTATION: &str = "usage";
pub const VERSION_ANNOTATION: &str = "storageVersion";

/// Suffix appended to the decimal byte count before the value is base64-encoded.
const UNIT_TAG: &str = "Bi";

/// The quota ledger stored in a storage class's annotations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuotaRecord {
    /// Maximum number of bytes that may be claimed against the class. Only
    /// operators set this value.
    pub quota_bytes: i64,

    /// Bytes currently accounted to claims against the class.
    pub usage_bytes: i64,

    /// Incremented by one on every write to `usage_bytes`.
    pub version: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing '{0}' annotation")]
    Missing(&'static str),

    #[error("'{key}' annotation is not valid base64: {source}")]
    Base64 {
        key: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("'{key}' annotation does not decode to UTF-8 text")]
    Utf8 { key: &'static str },

    #[error("'{key}' annotation value '{value}' does not end with the 'Bi' unit")]
    Unit { key: &'static str, value: String },

    #[error("'{key}' annotation value '{value}' is not an integer byte count")]
    Bytes { key: &'static str, value: String },

    #[error("'storageVersion' annotation value '{0}' is not a valid version")]
    Version(String),
}

/// Returns true if the annotations opt a storage class into quota management.
pub fn is_managed(annotations: &BTreeMap<String, String>) -> bool {
    annotations.contains_key(QUOTA_ANNOTATION)
}

// === impl QuotaRecord ===

impl QuotaRecord {
    pub fn decode(annotations: &BTreeMap<String, String>) -> Result<Self, DecodeError> {
        let quota_bytes = decode_bytes(QUOTA_ANNOTATION, annotations)?;
        let usage_bytes = decode_bytes(USAGE_ANNOTATION, annotations)?;
        let version = annotations
            .get(VERSION_ANNOTATION)
            .ok_or(DecodeError::Missing(VERSION_ANNOTATION))?;
        let version = version
            .trim()
            .parse()
            .map_err(|_| DecodeError::Version(version.clone()))?;
        Ok(Self {
            quota_bytes,
            usage_bytes,
            version,
        })
    }

    /// Returns a copy of `base` with this record's fields written over the
    /// quota annotations. Unrelated annotations are preserved.
    pub fn encode(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut annotations = base.clone();
        annotations.insert(QUOTA_ANNOTATION.to_string(), encode_bytes(self.quota_bytes));
        annotations.insert(USAGE_ANNOTATION.to_string(), encode_bytes(self.usage_bytes));
        annotations.insert(VERSION_ANNOTATION.to_string(), self.version.to_string());
        annotations
    }

    /// The record that results from writing `usage_bytes` over this one.
    pub fn advance(self, usage_bytes: i64) -> Self {
        Self {
            usage_bytes,
            version: self.version.wrapping_add(1),
            ..self
        }
    }
}

fn encode_bytes(bytes: i64) -> String {
    URL_SAFE.encode(format!("{bytes}{UNIT_TAG}"))
}

fn decode_bytes(
    key: &'static str,
    annotations: &BTreeMap<String, String>,
) -> Result<i64, DecodeError> {
    let encoded = annotations.get(key).ok_or(DecodeError::Missing(key))?;
    let raw = URL_SAFE
        .decode(encoded.trim())
        .map_err(|source| DecodeError::Base64 { key, source })?;
    let text = String::from_utf8(raw).map_err(|_| DecodeError::Utf8 { key })?;
    let digits = text.strip_suffix(UNIT_TAG).ok_or_else(|| DecodeError::Unit {
        key,
        value: text.clone(),
    })?;
    digits.parse().map_err(|_| DecodeError::Bytes {
        key,
        value: text.clone(),
    })
}
