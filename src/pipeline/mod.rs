//! The font assembly graph.
//!
//! Every stage is a method of [`Pipeline`] that, given its parameters,
//! returns the [`Handle`] of the task producing that stage's artifact. A
//! stage requests its upstream stages from inside its own declaration, so
//! asking for the archives pulls in exactly the matrix they need and
//! nothing else. Each distinct parameter tuple is declared once; later
//! requests for the same tuple get the same handle back.

mod hint;
mod package;
mod stages;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::BuildConfig;
use crate::context::Context;
use crate::engine::{Handle, Plan, Registry, Report, TaskContext};
use crate::error::{FontgraphError, ToolError};
use crate::tool::Options;

pub use crate::pipeline::hint::{hint_pairs, instruct_triples};
pub use crate::pipeline::package::archive_batches;

/// Compile flags for intermediate fonts, kept as close to the data as
/// possible.
const AS_IS: &[&str] = &["-k", "--keep-modified-time", "--keep-average-char-width", "-q"];

/// Compile flags for distributed fonts.
const OPTIMIZE: &[&str] = &["-O3", "--keep-average-char-width", "-q"];

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Both distributions and their archives.
    All,
    /// The per-file distribution and its archive.
    Ttf,
    /// The merged container distribution and its archive.
    Ttc,
    /// A single final font, for development.
    One {
        family: String,
        region: String,
        style: String,
    },
}

/// A font whose hinting is computed by the hint engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Part {
    Pass1 {
        family: String,
        region: String,
        style: String,
    },
    Kanji {
        region: String,
        weight: String,
    },
    Hangul {
        region: String,
        weight: String,
    },
}

impl Part {
    pub fn group(&self) -> &'static str {
        match self {
            Part::Pass1 { .. } => "pass1",
            Part::Kanji { .. } => "kanji",
            Part::Hangul { .. } => "hangul",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Part::Pass1 {
                family,
                region,
                style,
            } => format!("{family}-{region}-{style}"),
            Part::Kanji { region, weight } | Part::Hangul { region, weight } => {
                format!("{region}-{weight}")
            }
        }
    }

    /// Parameters of the part, group first, for use in task keys.
    pub fn params(&self) -> Vec<&str> {
        match self {
            Part::Pass1 {
                family,
                region,
                style,
            } => vec![self.group(), family.as_str(), region.as_str(), style.as_str()],
            Part::Kanji { region, weight } | Part::Hangul { region, weight } => {
                vec![self.group(), region.as_str(), weight.as_str()]
            }
        }
    }

    /// The weight whose hint parameters and chain position apply.
    pub fn weight<'a>(&'a self, config: &'a BuildConfig) -> &'a str {
        match self {
            Part::Pass1 { style, .. } => config.deitalized(style),
            Part::Kanji { weight, .. } | Part::Hangul { weight, .. } => weight,
        }
    }
}

/// Every part hinted together under one weight: the ideographs and Hangul
/// of each region, then the pass 1 composite of every family, region and
/// style whose canonical weight is `weight`.
pub fn parts_for_weight(config: &BuildConfig, weight: &str) -> Vec<Part> {
    let mut parts = Vec::new();

    for region in &config.region_order {
        parts.push(Part::Kanji {
            region: region.clone(),
            weight: weight.to_string(),
        });
        parts.push(Part::Hangul {
            region: region.clone(),
            weight: weight.to_string(),
        });
    }

    for family in &config.family_order {
        for region in &config.region_order {
            for style in &config.style_order {
                if config.deitalized(style) == weight {
                    parts.push(Part::Pass1 {
                        family: family.clone(),
                        region: region.clone(),
                        style: style.clone(),
                    });
                }
            }
        }
    }

    parts
}

/// The task graph of one run, declared on demand.
pub struct Pipeline<'a> {
    ctx: &'a Context,
    registry: Registry,
    chain: Option<Vec<(String, Handle)>>,
}

impl Plan for Pipeline<'_> {
    type Error = FontgraphError;

    fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            registry: Registry::new(),
            chain: None,
        }
    }

    /// The tasks declared so far.
    pub fn tasks(&self) -> &Registry {
        &self.registry
    }

    /// Declares everything `request` needs and returns its top-level
    /// handles.
    pub fn request(&mut self, request: &Request) -> Result<Vec<Handle>, FontgraphError> {
        let handles = match request {
            Request::All => vec![self.ttf_archive()?, self.ttc_archive()?],
            Request::Ttf => vec![self.ttf_archive()?],
            Request::Ttc => vec![self.ttc_archive()?],
            Request::One {
                family,
                region,
                style,
            } => {
                let config = self.ctx.config();
                config.family(family)?;
                config.region(region)?;
                config.style(style)?;
                vec![self.ttf_file(family, region, style)?]
            }
        };

        Ok(handles)
    }

    /// Executes the declared graph up to `targets`.
    pub fn run(&self, targets: &[Handle]) -> Result<Report, FontgraphError> {
        crate::engine::run(&self.registry, self.ctx, targets)
    }
}

/// A scratch path beside `out`, removed once the task succeeds.
fn scratch(task: &TaskContext, out: &Utf8Path, ext: &str) -> Utf8PathBuf {
    task.temp(out.with_extension(format!("tmp.{ext}")))
}

/// Runs a synthesis recipe of the font task runner.
fn recipe(task: &TaskContext, name: &str, options: &Options) -> Result<(), ToolError> {
    let tools = task.tools();
    let script = task
        .layout()
        .recipe(&tools.recipe_dir, name, &tools.recipe_ext);

    task.run(tools.recipes.invoke().arg(script).options(options))
}

/// Font data to font binary.
fn build_font(task: &TaskContext, otd: &Utf8Path, out: &Utf8Path, flags: &[&str]) -> Result<(), ToolError> {
    let invocation = task
        .tools()
        .otfcc_build
        .invoke()
        .arg(otd)
        .arg("-o")
        .arg(out)
        .args(flags);

    task.run(invocation)
}

/// Font binary to font data.
fn dump_font(task: &TaskContext, font: &Utf8Path, out: &Utf8Path) -> Result<(), ToolError> {
    task.run(task.tools().otfcc_dump.invoke().arg(font).arg("-o").arg(out))
}

/// Outline normalisation from cubic to quadratic curves.
fn to_truetype(task: &TaskContext, font: &Utf8Path, out: &Utf8Path) -> Result<(), ToolError> {
    task.run(task.tools().otf2ttf.invoke().arg(font).arg("-o").arg(out))
}
