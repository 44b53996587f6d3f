//! Namespaced document store layered over the in-memory [`Tree`].
//!
//! Layout inside the tree:
//!
//! ```text
//! /config/users/<db-user>              password hash
//! /db/<namespace>/_auth/<ns-user>      password hash
//! /db/<namespace>/<collection>/<doc>   document content
//! ```
//!
//! Every operation validates its arguments before touching the tree and
//! reports failures as [`StoreError`]; nothing here panics on bad input.

use anyhow::Context;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::auth::hash_password;
use crate::snapshot::{self, SnapshotError};
use crate::tree::{Tree, TreeError};


/// Collection names may not start with this; it marks internal registries.
pub const RESERVED_PREFIX: &str = "_";
/// Per-namespace user registry directory.
pub const AUTH_DIR: &str = "_auth";
/// Database user that can never be removed.
pub const ROOT_USER: &str = "root";
/// Namespace user seeded into every new namespace.
pub const BOOTSTRAP_USER: &str = "user";
pub const BOOTSTRAP_PASSWORD: &str = "user";

const DB_ROOT: &str = "/db";
const CONFIG_ROOT: &str = "/config";
const USERS_ROOT: &str = "/config/users";

/// Kinds of named entities, used in error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entity {
    Namespace,
    Collection,
    Document,
    User,
    NamespaceUser,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Namespace => "namespace",
            Entity::Collection => "collection",
            Entity::Document => "document",
            Entity::User => "user",
            Entity::NamespaceUser => "namespace user",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid {kind} name [{name}]")]
    InvalidName { kind: Entity, name: String },
    #[error("Invalid user password")]
    InvalidPassword,
    #[error("Cannot create existing {kind} [{name}]")]
    Exists { kind: Entity, name: String },
    #[error("Inexistent {kind} [{name}]")]
    Missing { kind: Entity, name: String },
    #[error("Impossible to remove root user [{0}]")]
    RootUser(String),
    #[error("Cannot remove the only user [{user}] from namespace [{namespace}]")]
    LastUser { user: String, namespace: String },
    #[error("Failure during namespace creation [{0}]")]
    CreateFailed(String),
    #[error("Storage failure: {0}")]
    Tree(#[from] TreeError),
    #[error("Persistence failure: {0}")]
    Snapshot(#[from] SnapshotError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What a namespace save did on durable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The namespace was exported.
    Exported,
    /// The namespace is gone from memory, so its durable copy was deleted.
    Removed,
}

fn check_name(kind: Entity, name: &str) -> StoreResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0');
    if invalid {
        return Err(StoreError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Namespace names double as durable file names; a leading dot is kept for
/// staging files.
fn check_namespace_name(name: &str) -> StoreResult<()> {
    check_name(Entity::Namespace, name)?;
    if name.starts_with('.') {
        return Err(StoreError::InvalidName {
            kind: Entity::Namespace,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn check_collection_name(name: &str) -> StoreResult<()> {
    check_name(Entity::Collection, name)?;
    if name == AUTH_DIR || name.starts_with(RESERVED_PREFIX) {
        return Err(StoreError::InvalidName {
            kind: Entity::Collection,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn check_password(password: &str) -> StoreResult<()> {
    if password.is_empty() {
        return Err(StoreError::InvalidPassword);
    }
    Ok(())
}

fn missing(kind: Entity, name: &str) -> StoreError {
    StoreError::Missing {
        kind,
        name: name.to_string(),
    }
}

/// Stored form of a document payload: strings verbatim, other JSON values
/// as compact JSON text, nothing as the empty string.
pub fn document_content(data: Option<&Value>) -> String {
    match data {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn ns_path(ns: &str) -> String {
    format!("{DB_ROOT}/{ns}")
}

fn col_path(ns: &str, col: &str) -> String {
    format!("{DB_ROOT}/{ns}/{col}")
}

fn doc_path(ns: &str, col: &str, doc: &str) -> String {
    format!("{DB_ROOT}/{ns}/{col}/{doc}")
}

fn ns_user_path(ns: &str, user: &str) -> String {
    format!("{DB_ROOT}/{ns}/{AUTH_DIR}/{user}")
}

fn db_user_path(user: &str) -> String {
    format!("{USERS_ROOT}/{user}")
}

pub struct Database {
    tree: Tree,
    storage_dir: PathBuf,
    config_path: PathBuf,
    // Saves run under a shared read lock; writes to one durable file are
    // serialized here.
    save_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Database {
    /// An empty database with no users. Nothing is read from or written to
    /// the given locations until a save.
    pub fn new(storage_dir: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        let mut tree = Tree::new();
        for dir in [DB_ROOT, CONFIG_ROOT, USERS_ROOT] {
            // Fresh tree: these cannot collide.
            let _ = tree.mkdir(dir);
        }
        Self {
            tree,
            storage_dir: storage_dir.into(),
            config_path: config_path.into(),
            save_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the database from durable storage.
    ///
    /// The config snapshot is loaded first; when it does not exist yet the
    /// root user is seeded with `root_password` and the config is written.
    /// Every file in `storage_dir` is then mounted as a namespace.
    pub fn boot(
        storage_dir: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        root_password: &str,
    ) -> anyhow::Result<Self> {
        let mut db = Self::new(storage_dir, config_path);
        std::fs::create_dir_all(&db.storage_dir).with_context(|| {
            format!("creating storage dir {}", db.storage_dir.display())
        })?;

        if db.config_path.exists() {
            snapshot::build(&mut db.tree, &db.config_path)
                .with_context(|| format!("loading config {}", db.config_path.display()))?;
            if !db.tree.exists(USERS_ROOT) {
                db.tree.mkdir(USERS_ROOT)?;
            }
        } else {
            info!(path = %db.config_path.display(), "no config found, seeding root user");
            db.create_database_user(ROOT_USER, root_password)?;
            db.save_config()?;
        }

        for path in db.durable_namespace_files()? {
            let root = snapshot::build(&mut db.tree, &path)
                .with_context(|| format!("loading namespace {}", path.display()))?;
            debug!(%root, "namespace loaded");
        }

        info!(
            namespaces = db.tree.readdir(DB_ROOT)?.len(),
            users = db.tree.readdir(USERS_ROOT)?.len(),
            "database booted"
        );
        Ok(db)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn namespace_exists(&self, ns: &str) -> bool {
        check_namespace_name(ns).is_ok() && self.tree.is_dir(&ns_path(ns))
    }

    fn require_namespace(&self, ns: &str) -> StoreResult<()> {
        check_namespace_name(ns)?;
        if !self.tree.is_dir(&ns_path(ns)) {
            return Err(missing(Entity::Namespace, ns));
        }
        Ok(())
    }

    fn require_collection(&self, ns: &str, col: &str) -> StoreResult<()> {
        check_namespace_name(ns)?;
        check_collection_name(col)?;
        self.require_namespace(ns)?;
        if !self.tree.is_dir(&col_path(ns, col)) {
            return Err(missing(Entity::Collection, col));
        }
        Ok(())
    }

    // --- namespaces ---

    pub fn create_namespace(&mut self, ns: &str) -> StoreResult<()> {
        check_namespace_name(ns)?;
        let path = ns_path(ns);
        if self.tree.exists(&path) {
            return Err(StoreError::Exists {
                kind: Entity::Namespace,
                name: ns.to_string(),
            });
        }
        self.tree.mkdir(&path)?;
        if let Err(err) = self.init_namespace(ns) {
            warn!(namespace = ns, error = %err, "namespace creation failed, rolling back");
            if self.tree.exists(&path) {
                let _ = self.tree.rmdir(&path, true);
            }
            return Err(StoreError::CreateFailed(ns.to_string()));
        }
        Ok(())
    }

    fn init_namespace(&mut self, ns: &str) -> StoreResult<()> {
        self.tree.mkdir(&col_path(ns, AUTH_DIR))?;
        self.tree.write(
            &ns_user_path(ns, BOOTSTRAP_USER),
            hash_password(BOOTSTRAP_PASSWORD),
        )?;
        Ok(())
    }

    pub fn remove_namespace(&mut self, ns: &str) -> StoreResult<()> {
        self.require_namespace(ns)?;
        self.tree.rmdir(&ns_path(ns), true)?;
        Ok(())
    }

    pub fn list_namespaces(&self) -> StoreResult<Vec<String>> {
        Ok(self.tree.readdir(DB_ROOT)?)
    }

    // --- database users ---

    /// Create a database user, or replace the password of an existing one.
    pub fn create_database_user(&mut self, user: &str, password: &str) -> StoreResult<()> {
        check_name(Entity::User, user)?;
        check_password(password)?;
        self.tree.write(&db_user_path(user), hash_password(password))?;
        Ok(())
    }

    pub fn remove_database_user(&mut self, user: &str) -> StoreResult<()> {
        check_name(Entity::User, user)?;
        if user == ROOT_USER {
            return Err(StoreError::RootUser(user.to_string()));
        }
        let path = db_user_path(user);
        if !self.tree.exists(&path) {
            return Err(missing(Entity::User, user));
        }
        self.tree.remove(&path)?;
        Ok(())
    }

    /// Stored password hash of a database user.
    pub fn get_database_user(&self, user: &str) -> StoreResult<String> {
        check_name(Entity::User, user)?;
        let path = db_user_path(user);
        if !self.tree.exists(&path) {
            return Err(missing(Entity::User, user));
        }
        Ok(self.tree.read(&path)?.to_string())
    }

    pub fn list_database_users(&self) -> StoreResult<Vec<String>> {
        Ok(self.tree.readdir(USERS_ROOT)?)
    }

    // --- collections ---

    pub fn create_collection(&mut self, ns: &str, col: &str) -> StoreResult<()> {
        check_namespace_name(ns)?;
        check_collection_name(col)?;
        self.require_namespace(ns)?;
        let path = col_path(ns, col);
        if self.tree.exists(&path) {
            return Err(StoreError::Exists {
                kind: Entity::Collection,
                name: col.to_string(),
            });
        }
        self.tree.mkdir(&path)?;
        Ok(())
    }

    pub fn remove_collection(&mut self, ns: &str, col: &str) -> StoreResult<()> {
        self.require_collection(ns, col)?;
        self.tree.rmdir(&col_path(ns, col), true)?;
        Ok(())
    }

    /// Collection names of a namespace; internal registries are hidden.
    pub fn list_collections(&self, ns: &str) -> StoreResult<Vec<String>> {
        self.require_namespace(ns)?;
        Ok(self
            .tree
            .readdir(&ns_path(ns))?
            .into_iter()
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .collect())
    }

    // --- documents ---

    /// Write a document, replacing any previous content.
    pub fn create_document(
        &mut self,
        ns: &str,
        col: &str,
        doc: &str,
        data: Option<&Value>,
    ) -> StoreResult<()> {
        check_name(Entity::Document, doc)?;
        self.require_collection(ns, col)?;
        self.tree
            .write(&doc_path(ns, col, doc), document_content(data))?;
        Ok(())
    }

    pub fn remove_document(&mut self, ns: &str, col: &str, doc: &str) -> StoreResult<()> {
        check_name(Entity::Document, doc)?;
        self.require_collection(ns, col)?;
        let path = doc_path(ns, col, doc);
        if !self.tree.exists(&path) {
            return Err(missing(Entity::Document, doc));
        }
        self.tree.remove(&path)?;
        Ok(())
    }

    pub fn get_document(&self, ns: &str, col: &str, doc: &str) -> StoreResult<String> {
        check_name(Entity::Document, doc)?;
        self.require_collection(ns, col)?;
        let path = doc_path(ns, col, doc);
        if !self.tree.exists(&path) {
            return Err(missing(Entity::Document, doc));
        }
        Ok(self.tree.read(&path)?.to_string())
    }

    pub fn list_documents(&self, ns: &str, col: &str) -> StoreResult<Vec<String>> {
        self.require_collection(ns, col)?;
        Ok(self.tree.readdir(&col_path(ns, col))?)
    }

    // --- namespace users ---

    /// Create a namespace user, or replace the password of an existing one.
    pub fn create_namespace_user(
        &mut self,
        ns: &str,
        user: &str,
        password: &str,
    ) -> StoreResult<()> {
        check_namespace_name(ns)?;
        check_name(Entity::User, user)?;
        check_password(password)?;
        self.require_namespace(ns)?;
        self.tree
            .write(&ns_user_path(ns, user), hash_password(password))?;
        Ok(())
    }

    pub fn remove_namespace_user(&mut self, ns: &str, user: &str) -> StoreResult<()> {
        check_namespace_name(ns)?;
        check_name(Entity::User, user)?;
        self.require_namespace(ns)?;
        let path = ns_user_path(ns, user);
        if !self.tree.exists(&path) {
            return Err(missing(Entity::User, user));
        }
        if self.list_namespace_users(ns)?.len() == 1 {
            return Err(StoreError::LastUser {
                user: user.to_string(),
                namespace: ns.to_string(),
            });
        }
        self.tree.remove(&path)?;
        Ok(())
    }

    pub fn list_namespace_users(&self, ns: &str) -> StoreResult<Vec<String>> {
        self.require_namespace(ns)?;
        Ok(self.tree.readdir(&col_path(ns, AUTH_DIR))?)
    }

    /// Stored password hash of a namespace user.
    pub fn get_namespace_user(&self, ns: &str, user: &str) -> StoreResult<String> {
        check_name(Entity::User, user)?;
        self.require_namespace(ns)?;
        let path = ns_user_path(ns, user);
        if !self.tree.exists(&path) {
            return Err(missing(Entity::NamespaceUser, user));
        }
        Ok(self.tree.read(&path)?.to_string())
    }

    // --- persistence ---

    fn durable_path(&self, ns: &str) -> PathBuf {
        self.storage_dir.join(ns)
    }

    /// Snapshot files currently in the storage directory.
    fn durable_namespace_files(&self) -> StoreResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.storage_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|err| {
                let path = err
                    .path()
                    .unwrap_or(&self.storage_dir)
                    .display()
                    .to_string();
                SnapshotError::Io {
                    path,
                    source: err.into(),
                }
            })?;
            // Staging leftovers and anything else that cannot be a
            // namespace name are skipped.
            let is_namespace = entry
                .file_name()
                .to_str()
                .is_some_and(|name| check_namespace_name(name).is_ok());
            if entry.file_type().is_file() && is_namespace {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    fn save_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.save_locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    fn export_durable(&self, root: &str, dest: &Path) -> StoreResult<()> {
        let lock = self.save_lock(dest);
        let _guard = lock.lock();
        snapshot::export(&self.tree, root, dest)?;
        Ok(())
    }

    fn remove_durable(&self, path: &Path) -> StoreResult<()> {
        let lock = self.save_lock(path);
        let _guard = lock.lock();
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_file(path).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Export one namespace to durable storage.
    ///
    /// A namespace that was removed in memory but still has a durable copy
    /// gets that copy deleted instead.
    pub fn save(&self, ns: &str) -> StoreResult<SaveOutcome> {
        check_namespace_name(ns)?;
        let durable = self.durable_path(ns);
        if !self.tree.is_dir(&ns_path(ns)) {
            if durable.is_file() {
                self.remove_durable(&durable)?;
                debug!(namespace = ns, "removed durable copy of deleted namespace");
                return Ok(SaveOutcome::Removed);
            }
            return Err(missing(Entity::Namespace, ns));
        }
        self.export_durable(&ns_path(ns), &durable)?;
        debug!(namespace = ns, path = %durable.display(), "namespace saved");
        Ok(SaveOutcome::Exported)
    }

    /// Export every namespace, then delete durable copies of namespaces that
    /// no longer exist. Returns the exported names.
    pub fn save_all(&self) -> StoreResult<Vec<String>> {
        std::fs::create_dir_all(&self.storage_dir).map_err(|source| SnapshotError::Io {
            path: self.storage_dir.display().to_string(),
            source,
        })?;
        let namespaces = self.list_namespaces()?;
        for ns in &namespaces {
            self.export_durable(&ns_path(ns), &self.durable_path(ns))?;
        }
        for path in self.durable_namespace_files()? {
            let known = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| namespaces.iter().any(|ns| ns == n));
            if !known {
                self.remove_durable(&path)?;
                debug!(path = %path.display(), "removed orphaned namespace file");
            }
        }
        debug!(count = namespaces.len(), "all namespaces saved");
        Ok(namespaces)
    }

    /// Export the database-user registry to the config file.
    pub fn save_config(&self) -> StoreResult<()> {
        self.export_durable(CONFIG_ROOT, &self.config_path)?;
        debug!(path = %self.config_path.display(), "config saved");
        Ok(())
    }
}
