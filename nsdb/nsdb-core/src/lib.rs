pub mod auth;
pub mod debounce;
pub mod ops;
pub mod snapshot;
pub mod store;
pub mod tree;

pub use auth::{AuthLevel, Credentials};
pub use debounce::{DebounceConfig, Debouncer};
pub use ops::{Dispatcher, Operation, Reply, RequestContext};
pub use store::{Database, StoreError};
