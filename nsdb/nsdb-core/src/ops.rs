//! Operation registry and dispatcher.
//!
//! Every request maps to one [`Operation`]. Its static
//! [`OperationDescriptor`] names the privilege level the caller must hold,
//! the handler run against the [`Database`] and the persistence side effects
//! of a successful run.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::AuthLevel;
use crate::debounce::{DebounceConfig, Debouncer};
use crate::store::{Database, SaveOutcome, StoreError, StoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateNamespace,
    RemoveNamespace,
    GetAllNamespaces,
    CreateDatabaseUser,
    RemoveDatabaseUser,
    GetDatabaseUser,
    GetAllDatabaseUsers,
    CreateCollection,
    RemoveCollection,
    GetAllCollections,
    CreateDocument,
    RemoveDocument,
    GetDocument,
    GetAllDocuments,
    CreateNamespaceUser,
    RemoveNamespaceUser,
    GetNamespaceUser,
    GetAllNamespaceUsers,
}

impl Operation {
    pub const ALL: [Operation; 18] = [
        Operation::CreateNamespace,
        Operation::RemoveNamespace,
        Operation::GetAllNamespaces,
        Operation::CreateDatabaseUser,
        Operation::RemoveDatabaseUser,
        Operation::GetDatabaseUser,
        Operation::GetAllDatabaseUsers,
        Operation::CreateCollection,
        Operation::RemoveCollection,
        Operation::GetAllCollections,
        Operation::CreateDocument,
        Operation::RemoveDocument,
        Operation::GetDocument,
        Operation::GetAllDocuments,
        Operation::CreateNamespaceUser,
        Operation::RemoveNamespaceUser,
        Operation::GetNamespaceUser,
        Operation::GetAllNamespaceUsers,
    ];

    pub fn descriptor(self) -> &'static OperationDescriptor {
        &REGISTRY[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOperation(pub String);

impl fmt::Display for UnknownOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operation [{}]", self.0)
    }
}

impl std::error::Error for UnknownOperation {}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REGISTRY
            .iter()
            .find(|d| d.name == s)
            .map(|d| d.operation)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// Decoded request: the caller's level plus the path components and body.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub level: AuthLevel,
    pub namespace: Option<String>,
    pub collection: Option<String>,
    pub document: Option<String>,
    pub db_user: Option<String>,
    pub ns_user: Option<String>,
    pub data: Option<Value>,
}

impl RequestContext {
    pub fn new(level: AuthLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    // Absent components are passed on as empty names, which the store
    // rejects as invalid.
    fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    fn collection(&self) -> &str {
        self.collection.as_deref().unwrap_or_default()
    }

    fn document(&self) -> &str {
        self.document.as_deref().unwrap_or_default()
    }

    fn db_user(&self) -> &str {
        self.db_user.as_deref().unwrap_or_default()
    }

    fn ns_user(&self) -> &str {
        self.ns_user.as_deref().unwrap_or_default()
    }

    fn password(&self) -> &str {
        self.data.as_ref().and_then(Value::as_str).unwrap_or_default()
    }
}

/// Response envelope shared by every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn permission_denied(op: Operation) -> Self {
        Self::err(format!("Permission Denied: {op}"))
    }
}

impl From<StoreResult<Option<Value>>> for Reply {
    fn from(result: StoreResult<Option<Value>>) -> Self {
        match result {
            Ok(data) => Reply::ok(data),
            Err(err) => Reply::err(err.to_string()),
        }
    }
}

type Handler = fn(&mut Database, &RequestContext) -> StoreResult<Option<Value>>;

pub struct OperationDescriptor {
    pub operation: Operation,
    pub name: &'static str,
    pub required: AuthLevel,
    /// Success schedules a coalesced save of the request's namespace.
    pub save: bool,
    /// Success exports the database-user registry right away.
    pub save_config: bool,
    pub handler: Handler,
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("save", &self.save)
            .field("save_config", &self.save_config)
            .finish()
    }
}

fn names(list: Vec<String>) -> Option<Value> {
    Some(Value::from(list))
}

fn done(_: ()) -> Option<Value> {
    None
}

// Indexed by `Operation as usize`; keep in declaration order.
static REGISTRY: [OperationDescriptor; 18] = [
    OperationDescriptor {
        operation: Operation::CreateNamespace,
        name: "createNamespace",
        required: AuthLevel::Database,
        save: true,
        save_config: false,
        handler: |db, ctx| db.create_namespace(ctx.namespace()).map(done),
    },
    OperationDescriptor {
        operation: Operation::RemoveNamespace,
        name: "removeNamespace",
        required: AuthLevel::Database,
        save: true,
        save_config: false,
        handler: |db, ctx| db.remove_namespace(ctx.namespace()).map(done),
    },
    OperationDescriptor {
        operation: Operation::GetAllNamespaces,
        name: "getAllNamespaces",
        required: AuthLevel::Database,
        save: false,
        save_config: false,
        handler: |db, _| db.list_namespaces().map(names),
    },
    OperationDescriptor {
        operation: Operation::CreateDatabaseUser,
        name: "createDatabaseUser",
        required: AuthLevel::Database,
        save: false,
        save_config: true,
        handler: |db, ctx| {
            db.create_database_user(ctx.db_user(), ctx.password())
                .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::RemoveDatabaseUser,
        name: "removeDatabaseUser",
        required: AuthLevel::Database,
        save: false,
        save_config: true,
        handler: |db, ctx| db.remove_database_user(ctx.db_user()).map(done),
    },
    OperationDescriptor {
        operation: Operation::GetDatabaseUser,
        name: "getDatabaseUser",
        required: AuthLevel::Database,
        save: false,
        save_config: false,
        handler: |db, ctx| db.get_database_user(ctx.db_user()).map(|h| Some(h.into())),
    },
    OperationDescriptor {
        operation: Operation::GetAllDatabaseUsers,
        name: "getAllDatabaseUsers",
        required: AuthLevel::Database,
        save: false,
        save_config: false,
        handler: |db, _| db.list_database_users().map(names),
    },
    OperationDescriptor {
        operation: Operation::CreateCollection,
        name: "createCollection",
        required: AuthLevel::Namespace,
        save: true,
        save_config: false,
        handler: |db, ctx| {
            db.create_collection(ctx.namespace(), ctx.collection())
                .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::RemoveCollection,
        name: "removeCollection",
        required: AuthLevel::Namespace,
        save: true,
        save_config: false,
        handler: |db, ctx| {
            db.remove_collection(ctx.namespace(), ctx.collection())
                .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::GetAllCollections,
        name: "getAllCollections",
        required: AuthLevel::Namespace,
        save: false,
        save_config: false,
        handler: |db, ctx| db.list_collections(ctx.namespace()).map(names),
    },
    OperationDescriptor {
        operation: Operation::CreateDocument,
        name: "createDocument",
        required: AuthLevel::Namespace,
        save: true,
        save_config: false,
        handler: |db, ctx| {
            db.create_document(
                ctx.namespace(),
                ctx.collection(),
                ctx.document(),
                ctx.data.as_ref(),
            )
            .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::RemoveDocument,
        name: "removeDocument",
        required: AuthLevel::Namespace,
        save: true,
        save_config: false,
        handler: |db, ctx| {
            db.remove_document(ctx.namespace(), ctx.collection(), ctx.document())
                .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::GetDocument,
        name: "getDocument",
        required: AuthLevel::Namespace,
        save: false,
        save_config: false,
        handler: |db, ctx| {
            db.get_document(ctx.namespace(), ctx.collection(), ctx.document())
                .map(|content| Some(content.into()))
        },
    },
    OperationDescriptor {
        operation: Operation::GetAllDocuments,
        name: "getAllDocuments",
        required: AuthLevel::Namespace,
        save: false,
        save_config: false,
        handler: |db, ctx| {
            db.list_documents(ctx.namespace(), ctx.collection())
                .map(names)
        },
    },
    OperationDescriptor {
        operation: Operation::CreateNamespaceUser,
        name: "createNamespaceUser",
        required: AuthLevel::Namespace,
        save: true,
        save_config: false,
        handler: |db, ctx| {
            db.create_namespace_user(ctx.namespace(), ctx.ns_user(), ctx.password())
                .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::RemoveNamespaceUser,
        name: "removeNamespaceUser",
        required: AuthLevel::Namespace,
        save: true,
        save_config: false,
        handler: |db, ctx| {
            db.remove_namespace_user(ctx.namespace(), ctx.ns_user())
                .map(done)
        },
    },
    OperationDescriptor {
        operation: Operation::GetNamespaceUser,
        name: "getNamespaceUser",
        required: AuthLevel::Namespace,
        save: false,
        save_config: false,
        handler: |db, ctx| {
            db.get_namespace_user(ctx.namespace(), ctx.ns_user())
                .map(|h| Some(h.into()))
        },
    },
    OperationDescriptor {
        operation: Operation::GetAllNamespaceUsers,
        name: "getAllNamespaceUsers",
        required: AuthLevel::Namespace,
        save: false,
        save_config: false,
        handler: |db, ctx| db.list_namespace_users(ctx.namespace()).map(names),
    },
];

/// Runs operations against a shared [`Database`] and persists the results.
pub struct Dispatcher {
    db: Arc<RwLock<Database>>,
    saver: Debouncer<String>,
}

impl Dispatcher {
    pub fn new(db: Arc<RwLock<Database>>, config: DebounceConfig) -> Self {
        let target = db.clone();
        let saver = Debouncer::new(config, move |ns: &String| {
            match target.read().save(ns) {
                Ok(SaveOutcome::Exported) => debug!(namespace = %ns, "namespace flushed"),
                Ok(SaveOutcome::Removed) => debug!(namespace = %ns, "namespace dropped from storage"),
                Err(err) => warn!(namespace = %ns, error = %err, "namespace flush failed"),
            }
        });
        Self { db, saver }
    }

    pub fn database(&self) -> &Arc<RwLock<Database>> {
        &self.db
    }

    /// Namespaces with a save still being coalesced.
    pub fn pending_saves(&self) -> usize {
        self.saver.pending()
    }

    /// Run `op` for `ctx`.
    ///
    /// The caller's level must equal the operation's required level exactly;
    /// a database user holds no namespace-level rights and vice versa.
    /// Saves triggered by the operation run on the calling thread, so async
    /// callers should go through `spawn_blocking`. Must be called from
    /// within a tokio runtime.
    pub fn dispatch(&self, op: Operation, ctx: &RequestContext) -> Reply {
        let descriptor = op.descriptor();
        if ctx.level != descriptor.required {
            debug!(operation = %op, level = ctx.level.as_u8(), "permission denied");
            return Reply::permission_denied(op);
        }

        let result = {
            let mut db = self.db.write();
            (descriptor.handler)(&mut db, ctx)
        };

        if result.is_ok() {
            if descriptor.save {
                if let Some(ns) = ctx.namespace.as_ref() {
                    self.saver.call(ns.clone());
                }
            }
            if descriptor.save_config {
                if let Err(err) = self.db.read().save_config() {
                    warn!(operation = %op, error = %err, "config save failed");
                }
            }
        }
        result.into()
    }

    /// Drop pending coalesced saves and write every namespace right away.
    pub fn flush_all(&self) -> Result<Vec<String>, StoreError> {
        let cancelled = self.saver.cancel_all();
        debug!(cancelled, "pending saves superseded by full flush");
        self.db.read().save_all()
    }
}
