//! Public facade over `sqlcache-core`: configuration, the host
//! cache-framework collaborator traits, and the assembled [`Store`].
//!
//! `sqlcache-core` has no opinion on key normalization, entry
//! serialization, or encryption; this crate supplies those opinions and
//! exposes the single entry point a host integration constructs.

pub mod config;
pub mod framework;
pub mod store;

pub use config::{Config, ShardTopology};
pub use framework::{
    CacheEntry, EncryptionWrapper, EntrySerializer, ErrorReporter, NoopStatsSink, RawBytesSerializer, ReportingErrorHandler,
    StatsSink, TracingErrorReporter,
};
pub use store::Store;

pub use sqlcache_core::{
    ClearWith, Dialect, Dispatcher, ErrorHandler, Executor, ExpiryBounds, ExpiryController, ExpiryMethod, Error, Failsafe,
    NoopErrorHandler, NoopRuntime, Repository, RuntimeWrapper, Strategy,
};
