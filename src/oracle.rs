use std::fs;
use std::sync::{Mutex, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::config::Toolchain;
use crate::core::{Fingerprint, Hash32};
use crate::error::ConfigError;

/// A read-only value computed at most once per run.
///
/// Concurrent first requests are serialized; a failed computation is not
/// cached, so the next request tries again.
pub struct Oracle<T> {
    cell: OnceLock<T>,
    lock: Mutex<()>,
}

impl<T> Default for Oracle<T> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
            lock: Mutex::new(()),
        }
    }
}

impl<T> Oracle<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }

        let _guard = self.lock.lock().unwrap();
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }

        let value = init()?;
        Ok(self.cell.get_or_init(|| value))
    }
}

#[derive(Deserialize)]
struct Metadata {
    version: String,
}

/// The oracles of a run.
#[derive(Default)]
pub struct Oracles {
    metadata: Utf8PathBuf,
    version: Oracle<String>,
    snapshot: Oracle<Hash32>,
    hint_jobs: Oracle<usize>,
    hint_jobs_override: Option<usize>,
}

impl Oracles {
    pub(crate) fn new(metadata: Utf8PathBuf, hint_jobs: Option<usize>) -> Self {
        Self {
            metadata,
            hint_jobs_override: hint_jobs,
            ..Default::default()
        }
    }

    /// Version string from the project metadata, used to name archives.
    pub fn version(&self) -> Result<&str, ConfigError> {
        self.version
            .get_or_try_init(|| read_version(&self.metadata))
            .map(String::as_str)
    }

    /// Fingerprint of everything outside the graph that affects every
    /// task: the external toolchain and the version of this crate.
    pub fn snapshot(&self, toolchain: &Toolchain) -> Hash32 {
        *self
            .snapshot
            .get_or_try_init(|| Ok::<_, std::convert::Infallible>(toolchain_fingerprint(toolchain)))
            .unwrap_or_else(|never| match never {})
    }

    /// Parallelism handed to the hint engine.
    pub fn hint_jobs(&self) -> usize {
        *self
            .hint_jobs
            .get_or_try_init(|| {
                Ok::<_, std::convert::Infallible>(
                    self.hint_jobs_override.unwrap_or_else(available_parallelism),
                )
            })
            .unwrap_or_else(|never| match never {})
    }
}

pub(crate) fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn read_version(path: &Utf8Path) -> Result<String, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    let metadata: Metadata = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;

    Ok(metadata.version)
}

fn toolchain_fingerprint(toolchain: &Toolchain) -> Hash32 {
    let mut fp = Fingerprint::new("toolchain");
    fp.str(env!("CARGO_PKG_VERSION"));

    for tool in [
        &toolchain.otfcc_dump,
        &toolchain.otfcc_build,
        &toolchain.otc2otf,
        &toolchain.otf2otc,
        &toolchain.otf2ttf,
        &toolchain.ttx,
        &toolchain.ttfautohint,
        &toolchain.hinter,
        &toolchain.archiver,
        &toolchain.recipes,
    ] {
        fp.str(&tool.program);
        for arg in &tool.args {
            fp.str(arg);
        }
    }

    for arg in &toolchain.archive_args {
        fp.str(arg);
    }
    fp.str(&toolchain.recipe_dir).str(&toolchain.recipe_ext);

    fp.finish()
}
