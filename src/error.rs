use crate::storage::StorageError;
use crate::types::LogIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the consensus engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The index is compacted away or beyond the end of the log.
    #[error("log index {index} out of range ({first}..={last})")]
    IndexOutOfRange {
        index: LogIndex,
        first: LogIndex,
        last: LogIndex,
    },
    /// An appended entry would leave a gap in the log.
    #[error("entry {index} does not follow last index {last}")]
    NonContiguous { index: LogIndex, last: LogIndex },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}
