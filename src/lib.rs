#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod context;
mod core;
pub mod engine;
mod error;
mod oracle;
mod pipeline;
pub mod tool;
mod utils;

use std::fs;
use std::io::ErrorKind;

pub use crate::config::{
    BuildConfig, BuildOptions, ContainerLayout, Family, LatinGroup, MetricsPolicy, Region, Style,
    Toolchain,
};
pub use crate::context::{Cancel, Context, ContextBuilder, Layout};
pub use crate::core::Hash32;
pub use crate::engine::{Handle, Report, TaskKey};
pub use crate::error::*;
pub use crate::oracle::Oracles;
pub use crate::pipeline::{
    Part, Pipeline, Request, archive_batches, hint_pairs, instruct_triples, parts_for_weight,
};
pub use crate::utils::{as_overhead, init_logging};

/// Declares the task graph needed for `request` without running anything.
pub fn plan<'a>(ctx: &'a Context, request: &Request) -> Result<(Pipeline<'a>, Vec<Handle>), FontgraphError> {
    let mut pipeline = Pipeline::new(ctx);
    let targets = pipeline.request(request)?;
    Ok((pipeline, targets))
}

/// Declares and runs everything `request` needs.
///
/// Task failures do not make this return an error, they are listed in the
/// returned [`Report`]. Errors are reserved for problems found before the
/// first task starts, like a bad configuration or a name that is not part
/// of it.
pub fn build(ctx: &Context, request: &Request) -> Result<Report, FontgraphError> {
    let (pipeline, targets) = plan(ctx, request)?;
    tracing::info!("Declared {} tasks", pipeline.tasks().len());
    pipeline.run(&targets)
}

/// Removes the intermediate and distribution directories.
pub fn clean(layout: &Layout) -> Result<(), FontgraphError> {
    for dir in [layout.build(), layout.out()] {
        match fs::remove_dir_all(&dir) {
            Ok(()) => tracing::info!("Removed {dir}"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}
