//! The SQL-backed cache engine: entry repository, connection dispatcher,
//! failsafe envelope, expiry controller, and execution layer.
//!
//! This crate is the "hard engineering" a host-facing cache API sits on
//! top of. It has no opinion on how keys are normalized or how values are
//! serialized — that's [`sqlcache`](../sqlcache/index.html)'s job.

pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod executor;
pub mod expiry;
pub mod failsafe;
pub mod key;
pub mod repository;

pub use dispatcher::{Dispatcher, Strategy};
pub use entry::{now_millis, EntryRow, Payload};
pub use error::Error;
pub use executor::{Executor, NoopRuntime, RuntimeWrapper, Task};
pub use expiry::{Bounds as ExpiryBounds, ExpiryController, Method as ExpiryMethod};
pub use failsafe::{ErrorHandler, Failsafe, NoopErrorHandler};
pub use key::{hash_key, normalize_key, DEFAULT_MAX_KEY_BYTESIZE};
pub use repository::{ClearWith, Dialect, Repository, MAX_BATCH};
