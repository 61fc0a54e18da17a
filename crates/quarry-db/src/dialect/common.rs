//! The default dialect.

use std::sync::LazyLock;

use quarry_types::Value;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::Dialect;
use crate::details::ConnectionDetails;

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("valid regex"));

/// Hex characters of the content hash kept in shortened key names.
const KEY_HASH_LEN: usize = 40;

/// Default dialect behavior, held by every family dialect.
#[derive(Debug, Clone)]
pub struct CommonDialect {
    pub(crate) details: ConnectionDetails,
}

impl CommonDialect {
    /// Binds the default dialect to `details`.
    pub fn new(details: ConnectionDetails) -> Self {
        Self { details }
    }

    /// Interprets a limit or offset argument, rejecting negatives and
    /// anything that is not an integer.
    pub fn non_negative(value: &Value) -> Option<i64> {
        let parsed = match value {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.filter(|n| *n >= 0)
    }

    /// Replaces each run of non-alphanumeric characters with `_`.
    pub fn sanitize(raw: &str) -> String {
        NON_ALPHANUMERIC.replace_all(raw, "_").into_owned()
    }

    /// `kind_table_field..`, sanitized.
    pub fn key_name(kind: &str, table: &str, fields: &[&str]) -> String {
        let mut parts = vec![kind, table];
        parts.extend_from_slice(fields);
        Self::sanitize(&parts.join("_"))
    }

    /// Shortens `name` to at most `cap` characters: as much of the sanitized
    /// `lead` as fits, then the first 40 hex characters of SHA-256(`name`).
    pub fn hashed_key_name(name: &str, lead: &str, cap: usize) -> String {
        let digest = hex::encode(Sha256::digest(name.as_bytes()));
        let hash_len = KEY_HASH_LEN.min(cap);
        let prefix: String = Self::sanitize(lead)
            .chars()
            .take(cap.saturating_sub(hash_len))
            .collect();
        format!("{prefix}{}", &digest[..hash_len])
    }
}

impl Dialect for CommonDialect {
    fn common(&self) -> &CommonDialect {
        self
    }

    fn name(&self) -> &'static str {
        "common"
    }
}
