//! Fingerprint computation for cache keys.
//!
//! A cache key combines two fingerprints:
//!
//! - the **engine fingerprint**, a SHA-256 over the build id, the full content
//!   hash of the executing code, and the environment signature. Any change to
//!   the code producing cached values changes this prefix.
//! - the **request fingerprint**, a SHA-256 over the canonical form of the
//!   request parameters, so logically identical requests share a key.
//!
//! # Canonical form
//!
//! - object members are sorted by key; members whose value is `null` and
//!   members named in the ignore list are dropped
//! - numbers are rendered with a fixed number of decimal places, so `1`,
//!   `1.0` and `1.000` are the same value
//! - array order is preserved (it is semantic)
//! - strings are JSON-escaped; whitespace outside strings never reaches the
//!   canonical form

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use crate::config::KilnConfig;
use crate::error::FingerprintError;
use crate::identity::content_hash_hex;
use crate::key::{validate_kind, CacheKey};

/// Maximum nesting accepted in request parameters.
pub const MAX_DEPTH: usize = 64;

/// Environment variable prefix collected into the environment signature.
const ENV_SIGNATURE_PREFIX: &str = "KILN_ENV_";

// ============================================================================
// ENGINE IDENTITY
// ============================================================================

/// Identity of the code that produces cached values.
///
/// Deserialization goes through [`EngineIdentity::new`], so a decoded identity
/// carries the same guarantees as a constructed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEngineIdentity")]
pub struct EngineIdentity {
    build_id: String,
    code_hash: String,
    environment: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawEngineIdentity {
    build_id: String,
    code_hash: String,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

impl TryFrom<RawEngineIdentity> for EngineIdentity {
    type Error = FingerprintError;

    fn try_from(raw: RawEngineIdentity) -> Result<Self, Self::Error> {
        EngineIdentity::new(raw.build_id, raw.code_hash, raw.environment)
    }
}

/// Shortest accepted code hash: a full git (SHA-1) commit id.
const MIN_CODE_HASH_LEN: usize = 40;

impl EngineIdentity {
    /// Create an engine identity.
    ///
    /// `code_hash` must be a full-length hex digest: at least 40 characters
    /// (a git commit), longer digests such as SHA-256 or SHA-512 are fine.
    /// Abbreviated hashes are rejected outright: short prefixes collide
    /// across deployed versions.
    pub fn new<I, K, V>(
        build_id: impl Into<String>,
        code_hash: impl Into<String>,
        environment: I,
    ) -> Result<Self, FingerprintError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let build_id = build_id.into();
        if build_id.trim().is_empty() {
            return Err(FingerprintError::InvalidEngineIdentity {
                reason: "build id must not be empty".to_string(),
            });
        }

        let code_hash = code_hash.into().trim().to_ascii_lowercase();
        if !code_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidEngineIdentity {
                reason: format!("code hash {code_hash:?} is not hex"),
            });
        }
        let len = code_hash.len();
        if len < MIN_CODE_HASH_LEN {
            return Err(FingerprintError::TruncatedCodeHash {
                hash: code_hash,
                len,
            });
        }

        Ok(Self {
            build_id,
            code_hash,
            environment: environment
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    /// Build an identity by hashing source files.
    ///
    /// Files are hashed in path order, each framed by its path and length, so
    /// renames and content moves between files both change the hash.
    pub fn from_sources<P, I, K, V>(
        build_id: impl Into<String>,
        sources: &[P],
        environment: I,
    ) -> Result<Self, FingerprintError>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if sources.is_empty() {
            return Err(FingerprintError::InvalidEngineIdentity {
                reason: "no source files given".to_string(),
            });
        }

        let mut paths: Vec<&Path> = sources.iter().map(AsRef::as_ref).collect();
        paths.sort();

        let mut framed = Vec::new();
        for path in paths {
            let content = std::fs::read(path).map_err(|e| {
                FingerprintError::InvalidEngineIdentity {
                    reason: format!("cannot read {}: {e}", path.display()),
                }
            })?;
            let name = path.to_string_lossy();
            framed.extend_from_slice(&(name.len() as u64).to_le_bytes());
            framed.extend_from_slice(name.as_bytes());
            framed.extend_from_slice(&(content.len() as u64).to_le_bytes());
            framed.extend_from_slice(&content);
        }

        Self::new(build_id, content_hash_hex(&framed), environment)
    }

    /// Read the identity from `KILN_BUILD_ID`, `KILN_CODE_HASH` and every
    /// `KILN_ENV_*` variable.
    pub fn from_env() -> Result<Self, FingerprintError> {
        let build_id = std::env::var("KILN_BUILD_ID").map_err(|_| {
            FingerprintError::InvalidEngineIdentity {
                reason: "KILN_BUILD_ID is not set".to_string(),
            }
        })?;
        let code_hash = std::env::var("KILN_CODE_HASH").map_err(|_| {
            FingerprintError::InvalidEngineIdentity {
                reason: "KILN_CODE_HASH is not set".to_string(),
            }
        })?;
        let environment = std::env::vars().filter_map(|(k, v)| {
            k.strip_prefix(ENV_SIGNATURE_PREFIX)
                .map(|name| (name.to_ascii_lowercase(), v))
        });
        Self::new(build_id, code_hash, environment)
    }

    /// Build identifier (version string, release tag).
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Full content hash of the executing code.
    pub fn code_hash(&self) -> &str {
        &self.code_hash
    }

    /// Environment signature entries.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Full-length engine fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut framed = String::new();
        push_framed(&mut framed, "build", &self.build_id);
        push_framed(&mut framed, "code", &self.code_hash);
        for (k, v) in &self.environment {
            push_framed(&mut framed, k, v);
        }
        content_hash_hex(framed.as_bytes())
    }
}

fn push_framed(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "{}:{}={}:{};", name.len(), name, value.len(), value);
}

// ============================================================================
// CANONICALIZER
// ============================================================================

/// Produces the canonical text form of request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonicalizer {
    decimal_places: u8,
    ignored_fields: BTreeSet<String>,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self {
            decimal_places: 6,
            ignored_fields: BTreeSet::new(),
        }
    }
}

impl Canonicalizer {
    /// Create a canonicalizer with the default precision and no ignored fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalizer with the configured numeric precision.
    pub fn from_config(config: &KilnConfig) -> Self {
        Self::default().with_decimal_places(config.decimal_places)
    }

    /// Set the decimal places numbers are normalized to.
    pub fn with_decimal_places(mut self, places: u8) -> Self {
        self.decimal_places = places;
        self
    }

    /// Drop a non-semantic field (at any depth) before hashing.
    pub fn ignore_field(mut self, name: impl Into<String>) -> Self {
        self.ignored_fields.insert(name.into());
        self
    }

    /// Canonical text form of a JSON value.
    pub fn canonicalize(&self, value: &Value) -> Result<String, FingerprintError> {
        let mut out = String::new();
        self.write_value(&mut out, value, 0)?;
        Ok(out)
    }

    /// Full-length request fingerprint of a JSON value.
    pub fn fingerprint(&self, value: &Value) -> Result<String, FingerprintError> {
        Ok(content_hash_hex(self.canonicalize(value)?.as_bytes()))
    }

    /// Parse JSON text and fingerprint it.
    pub fn fingerprint_str(&self, json: &str) -> Result<String, FingerprintError> {
        let value: Value = serde_json::from_str(json).map_err(|e| FingerprintError::Malformed {
            reason: e.to_string(),
        })?;
        self.fingerprint(&value)
    }

    fn write_value(&self, out: &mut String, value: &Value, depth: usize) -> Result<(), FingerprintError> {
        if depth > MAX_DEPTH {
            return Err(FingerprintError::TooDeep { max_depth: MAX_DEPTH });
        }
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => self.write_number(out, n)?,
            Value::String(s) => write_string(out, s)?,
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_value(out, item, depth + 1)?;
                }
                out.push(']');
            }
            Value::Object(map) => self.write_object(out, map, depth)?,
        }
        Ok(())
    }

    fn write_object(
        &self,
        out: &mut String,
        map: &Map<String, Value>,
        depth: usize,
    ) -> Result<(), FingerprintError> {
        let members: BTreeMap<&str, &Value> = map
            .iter()
            .filter(|(k, v)| !v.is_null() && !self.ignored_fields.contains(k.as_str()))
            .map(|(k, v)| (k.as_str(), v))
            .collect();

        out.push('{');
        for (i, (k, v)) in members.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_string(out, k)?;
            out.push(':');
            self.write_value(out, v, depth + 1)?;
        }
        out.push('}');
        Ok(())
    }

    fn write_number(&self, out: &mut String, n: &Number) -> Result<(), FingerprintError> {
        let places = usize::from(self.decimal_places);
        let text = if let Some(i) = n.as_i64() {
            fixed_integer(&i.to_string(), places)
        } else if let Some(u) = n.as_u64() {
            fixed_integer(&u.to_string(), places)
        } else {
            let f = n.as_f64().filter(|f| f.is_finite()).ok_or_else(|| {
                FingerprintError::Malformed {
                    reason: format!("number {n} is not representable"),
                }
            })?;
            format!("{:.*}", places, f)
        };
        out.push_str(normalize_negative_zero(&text));
        Ok(())
    }
}

fn fixed_integer(digits: &str, places: usize) -> String {
    if places == 0 {
        digits.to_string()
    } else {
        format!("{digits}.{}", "0".repeat(places))
    }
}

fn normalize_negative_zero(text: &str) -> &str {
    match text.strip_prefix('-') {
        Some(rest) if rest.bytes().all(|b| b == b'0' || b == b'.') => rest,
        _ => text,
    }
}

fn write_string(out: &mut String, s: &str) -> Result<(), FingerprintError> {
    let escaped = serde_json::to_string(s).map_err(|e| FingerprintError::Malformed {
        reason: e.to_string(),
    })?;
    out.push_str(&escaped);
    Ok(())
}

// ============================================================================
// FINGERPRINT COMPUTER
// ============================================================================

/// Derives cache keys from an engine identity and request parameters.
#[derive(Debug, Clone, Default)]
pub struct FingerprintComputer {
    canonicalizer: Canonicalizer,
}

impl FingerprintComputer {
    /// Create a computer with the given canonicalizer.
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self { canonicalizer }
    }

    pub fn from_config(config: &KilnConfig) -> Self {
        Self::new(Canonicalizer::from_config(config))
    }

    /// The canonicalizer in use.
    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canonicalizer
    }

    /// Compute `<engine-fingerprint>:<kind>:<request-fingerprint>`.
    pub fn compute_key(
        &self,
        kind: &str,
        engine: &EngineIdentity,
        params: &Value,
    ) -> Result<CacheKey, FingerprintError> {
        validate_kind(kind)?;
        let request = self.canonicalizer.fingerprint(params)?;
        Ok(CacheKey::from_parts(&engine.fingerprint(), kind, &request))
    }

    /// Compute a key from serializable request parameters.
    pub fn compute_key_for<T: Serialize>(
        &self,
        kind: &str,
        engine: &EngineIdentity,
        params: &T,
    ) -> Result<CacheKey, FingerprintError> {
        let value = serde_json::to_value(params).map_err(|e| FingerprintError::Malformed {
            reason: e.to_string(),
        })?;
        self.compute_key(kind, engine, &value)
    }
}
