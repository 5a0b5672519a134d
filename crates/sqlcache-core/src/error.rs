//! The error currency shared by the repository, dispatcher, and failsafe.

use recoverable::{Recover, Recovery};

/// Errors raised while talking to the `entries` table.
///
/// Every variant implements [`Recover`] so the failsafe envelope (see
/// [`crate::failsafe`]) can decide whether to swallow it or let it
/// propagate without a bespoke string or error-code match at the call
/// site.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One of the transient storage conditions enumerated in the error
    /// taxonomy: timeouts, deadlocks, lock-wait timeouts, connections that
    /// never established, cancelled queries, or adapter-level timeouts.
    /// Callers should retry or accept a defaulted value; the failsafe
    /// envelope does the latter automatically.
    #[error("transient storage error: {0}")]
    Transient(#[source] sqlx::Error),

    /// A storage error outside the transient taxonomy: schema mismatches,
    /// constraint violations outside the upsert path, or anything else
    /// that retrying would not fix. Propagates past the failsafe.
    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),

    /// The requested operation is not supported by this engine (`cleanup`,
    /// `delete_matched`). Raised immediately; never swallowed.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A configuration value was invalid (e.g. an empty shard list, or a
    /// named shard that doesn't exist in the dispatcher's registry).
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classifies a raw `sqlx::Error` into the core's transient/permanent
    /// taxonomy (spec'd error kinds in the failsafe envelope).
    ///
    /// The classification is deliberately conservative: anything that
    /// looks like contention, a closed/never-opened connection, or a
    /// timeout is transient; everything else is treated as permanent so
    /// real bugs (bad SQL, schema drift) are never silently absorbed.
    #[must_use]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            Error::Transient(err)
        } else {
            Error::Storage(err)
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            const TRANSIENT_MARKERS: [&str; 6] =
                ["deadlock", "lock wait", "timeout", "cancel", "connection", "not established"];
            TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
        }
        _ => false,
    }
}

impl Recover for Error {
    fn recovery(&self) -> Recovery {
        match self {
            Error::Transient(_) => Recovery::retry(),
            Error::Storage(_) | Error::Unsupported(_) | Error::Config(_) => Recovery::never(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classifies_as_retry() {
        let err = Error::Transient(sqlx::Error::PoolTimedOut);
        assert_eq!(err.recovery().kind(), recoverable::RecoveryKind::Retry);
    }

    #[test]
    fn storage_classifies_as_never() {
        let err = Error::Storage(sqlx::Error::PoolTimedOut);
        assert_eq!(err.recovery().kind(), recoverable::RecoveryKind::Never);
    }

    #[test]
    fn unsupported_classifies_as_never() {
        let err = Error::Unsupported("cleanup");
        assert_eq!(err.recovery().kind(), recoverable::RecoveryKind::Never);
    }

    #[test]
    fn pool_timed_out_is_classified_transient() {
        let err = Error::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::Transient(_)));
    }
}
