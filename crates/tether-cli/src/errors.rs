//! Error types for the CLI runtime.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to read descriptor {path}: {source}")]
    ReadDescriptor {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse descriptor {path}: {source}")]
    ParseDescriptor {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write descriptor {path}: {source}")]
    WriteDescriptor {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialise descriptor: {0}")]
    SerialiseDescriptor(#[source] serde_json::Error),
    #[error("no plugin program given")]
    MissingProgram,
    #[error("plugin connected but produced no reattach descriptor")]
    MissingDescriptor,
    #[error(transparent)]
    Client(#[from] tether::ClientError),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}
