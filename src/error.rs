use std::io;

use thiserror::Error;

/// Error returned when loading or persisting a [`crate::CheckpointStore`].
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint file exists but its contents do not parse as a valid
    /// epoch history.
    #[error("corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    /// An I/O error occurred reading, writing, or renaming the checkpoint.
    #[error("checkpoint I/O failure at {path}")]
    IoFailure {
        path: String,
        #[source]
        source: io::Error,
    },
}
