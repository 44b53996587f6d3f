//! Credential checks for the two user registries.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::digest::{digest, SHA256};
use std::fmt::Write;

use crate::store::Database;

/// Privilege level derived from a request's credentials.
///
/// Levels are disjoint domains rather than a hierarchy: an operation is
/// only allowed for callers whose level equals the one it requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuthLevel {
    #[default]
    None = 0,
    Namespace = 1,
    Database = 2,
}

impl AuthLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Username/password pair taken from a request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse an `Authorization: Basic <base64(user:password)>` header value.
    pub fn from_basic(header: &str) -> Option<Self> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self::new(username, password))
    }
}

/// Lower-case hex SHA-256 of a password, the form stored in both registries.
pub fn hash_password(password: &str) -> String {
    let hash = digest(&SHA256, password.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in hash.as_ref() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Resolve the privilege level of `creds`.
///
/// The database-user registry is tried first; the namespace registry is only
/// consulted when that fails and a namespace is known. Unknown users and
/// wrong passwords both resolve to [`AuthLevel::None`].
pub fn resolve(db: &Database, creds: &Credentials, namespace: Option<&str>) -> AuthLevel {
    let hashed = hash_password(&creds.password);

    if let Ok(stored) = db.get_database_user(&creds.username) {
        if stored == hashed {
            return AuthLevel::Database;
        }
    }

    if let Some(ns) = namespace {
        if let Ok(stored) = db.get_namespace_user(ns, &creds.username) {
            if stored == hashed {
                return AuthLevel::Namespace;
            }
        }
    }

    AuthLevel::None
}
