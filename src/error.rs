use camino::Utf8PathBuf;
use thiserror::Error;

use crate::engine::TaskKey;

#[derive(Debug, Error)]
pub enum FontgraphError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while building the font matrix.\n{0}")]
    Build(#[from] BuildError),

    #[error("Failed to start the worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed or internally inconsistent configuration. Raised before any
/// external process runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read '{path}':\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse '{path}':\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Family '{family}' refers to an undefined latin group '{group}'")]
    UnknownLatinGroup { family: String, group: String },

    #[error("Style '{style}' maps to an undefined upright style '{upright}'")]
    UnknownUprightStyle { style: String, upright: String },

    #[error("Style '{style}' maps to '{upright}', which is itself mapped to another style")]
    ChainedUprightStyle { style: String, upright: String },

    #[error("Style '{style}' maps to '{upright}', which is not listed in the style order")]
    UnorderedUprightStyle { style: String, upright: String },

    #[error("Style order must alternate upright and italic styles, found '{found}' where {expected} style was expected")]
    StylePairing { found: String, expected: &'static str },

    #[error("Style order lists '{0}', which is not defined in the style table")]
    UnknownStyle(String),

    #[error("Family order lists '{0}', which is not defined in the family table")]
    UnknownFamily(String),

    #[error("Region order lists '{0}', which has no entry in the region table")]
    UnknownRegion(String),

    #[error("Region '{0}' has no part in the source container layout")]
    MissingRegionPart(String),

    #[error("Weight '{0}' has no file suffix in the source container layout")]
    MissingWeightSuffix(String),

    #[error("{0} order is empty")]
    Empty(&'static str),

    #[error("Unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
}

/// Failure of an external program.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Couldn't start '{program}':\n{source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}\n{stderr}{stdout}")]
    Failed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Missing source file '{0}'")]
    MissingSource(Utf8PathBuf),

    #[error("Task '{key}' finished without producing '{path}'")]
    MissingOutput { key: TaskKey, path: Utf8PathBuf },

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(TaskKey),

    #[error("Couldn't write the journal '{path}':\n{source}")]
    Journal {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Task '{0}':\n{1:#}")]
    Task(TaskKey, anyhow::Error),

    #[error("Cancelled: upstream task '{0}' failed")]
    Cancelled(TaskKey),
}
