use thiserror::Error;

/// Errors surfaced by the fabric.
///
/// Datapath errors (anything raised inside a world operation) terminate the
/// calling rank and are observable to its driver. Control-path errors are
/// recovered by the scheduler through retry-or-overload.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out waiting on queue")]
    Timeout,

    #[error("invalid function: {0}")]
    InvalidFunction(String),

    #[error("rank {rank} bigger than world size {size}")]
    RankOutOfRange { rank: i32, size: i32 },

    #[error("no host entry for rank {0}")]
    UnknownRank(i32),

    #[error("rank {0} is not registered on this host")]
    RankNotLocal(i32),

    #[error("waiting for unrecognized request {0}")]
    UnknownRequest(u64),

    #[error("message types mismatched (expected={expected:?}, got={got:?})")]
    TypeMismatch {
        expected: crate::mpi::MpiMessageType,
        got: crate::mpi::MpiMessageType,
    },

    #[error("message too long for buffer (msg={got}, buffer={want})")]
    Truncation { got: usize, want: usize },

    #[error("mismatching send/recv datatypes")]
    SendRecvMismatch,

    #[error("unsupported reduction (op={op:?}, datatype={datatype:?})")]
    UnsupportedReduceOp {
        op: crate::mpi::MpiOp,
        datatype: crate::mpi::MpiDatatype,
    },

    #[error("message not meant for this world (msg={got}, this={expected})")]
    WorldMismatch { expected: i32, got: i32 },

    #[error("world ID must be bigger than zero ({0})")]
    InvalidWorldId(i32),

    #[error("no window registered under {0}")]
    UnregisteredWindow(String),

    #[error("cannot bind worker more than once")]
    AlreadyBound,

    #[error("executing {0} messages outside thread mode is unsupported")]
    UnsupportedBatch(usize),

    #[error("cannot force bind to a different function")]
    ForceBindMismatch,

    #[error("dimension error: {0}")]
    BadTopology(String),

    #[error("world used before creation or initialisation")]
    WorldNotInitialised,

    #[error("state key not found: {0}")]
    KeyNotFound(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
