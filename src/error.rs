use std::path::PathBuf;

use thiserror::Error;

use crate::types::Topic;

/// Reasons a bus message does not advance the merger
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Malformed {topic} payload: {source}")]
    Malformed {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },

    #[error("{topic} sample without {field}")]
    MissingField { topic: Topic, field: &'static str },

    #[error("Failed to encode track point: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid store key: {0}")]
    InvalidKey(String),
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Dataset unknown: {0}")]
    UnknownDataset(String),

    #[error("Data doesn't match the archived copy of {0}")]
    Conflict(String),

    #[error("Dataset {0} already holds live data")]
    AlreadyLive(String),

    #[error("Invalid dataset id: {0}")]
    InvalidId(String),

    #[error("Invalid dataset filter: {0}")]
    InvalidFilter(String),

    #[error("Track point without {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed archive data: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
