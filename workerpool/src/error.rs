// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is closed, job dropped")]
    Closed,
    #[error("job queue is full, job dropped")]
    Full,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid dispatcher config: {0}")]
    Parse(#[from] serde_json::Error),
}
