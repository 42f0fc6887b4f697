use thiserror::Error;

/// The crate-wide error taxonomy.
///
/// Every fallible operation in this crate returns one of these. The first
/// five variants are concept-level outcomes any pipe-shaped operation can
/// produce; `Io` passes OS errors through unchanged from `Descriptor` and
/// `Process`.
#[derive(Debug, Error)]
pub enum Error {
    /// A `timeout` elapsed before the operation could complete.
    #[error("operation timed out")]
    Timeout,

    /// The local side of the endpoint used was already closed.
    #[error("endpoint closed")]
    Closed,

    /// The peer endpoint's last handle was dropped.
    #[error("peer abandoned")]
    Abandoned,

    /// The hub is shutting down; the task should unwind.
    #[error("hub is stopping")]
    Stop,

    /// The hub forced a wake during teardown that can never otherwise be
    /// satisfied.
    #[error("forced wake during shutdown")]
    Halt,

    /// An OS-level error, surfaced unchanged (`ENOENT`, `EACCES`, `EPIPE`, …).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(Error::Abandoned.to_string(), "peer abandoned");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
