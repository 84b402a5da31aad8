//! The hinting chain.
//!
//! Hinting runs in three phases per weight. *Analyze* computes hint data
//! for every part of the weight in one invocation of the hint engine,
//! *instruct* turns it into TrueType instructions and *integrate* merges
//! the instructions back into each part.
//!
//! Instruct of a weight depends on instruct of the previous weight in
//! style order, so the whole chain is sequential at that phase while
//! everything around it stays parallel.

use camino::Utf8PathBuf;

use crate::context::{Context, Layout};
use crate::engine::{Handle, Plan, TaskDef, TaskKey};
use crate::error::{ConfigError, FontgraphError};
use crate::pipeline::stages::unhinted_otd_path;
use crate::pipeline::{AS_IS, Part, Pipeline, build_font, parts_for_weight, scratch};
use crate::tool::Options;

fn hint_path(layout: &Layout, part: &Part, ext: &str) -> Utf8PathBuf {
    layout.artifact(&format!("hint/{}", part.group()), &part.name(), ext)
}

/// Input font data and hint data file of every part, in the order the
/// hint engine receives them.
pub fn hint_pairs(ctx: &Context, parts: &[Part]) -> Vec<(Utf8PathBuf, Utf8PathBuf)> {
    parts
        .iter()
        .map(|part| (unhinted_otd_path(ctx, part), hint_path(&ctx.layout, part, "hint.gz")))
        .collect()
}

/// Input font data, hint data and instruction file of every part.
pub fn instruct_triples(ctx: &Context, parts: &[Part]) -> Vec<(Utf8PathBuf, Utf8PathBuf, Utf8PathBuf)> {
    parts
        .iter()
        .map(|part| {
            (
                unhinted_otd_path(ctx, part),
                hint_path(&ctx.layout, part, "hint.gz"),
                hint_path(&ctx.layout, part, "instr.gz"),
            )
        })
        .collect()
}

impl Pipeline<'_> {
    /// Hint analysis of every part of `weight`.
    pub fn analyze(&mut self, weight: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("analyze", [weight]), |p| {
            let parts = parts_for_weight(ctx.config(), weight);
            let otds = parts
                .iter()
                .map(|part| p.unhinted_otd(part))
                .collect::<Result<Vec<_>, _>>()?;

            let pairs = hint_pairs(ctx, &parts);
            let params = ctx.layout.hint_params(weight);
            let cache = ctx.layout.hint_cache(weight);
            let jobs = ctx.hint_jobs();

            Ok(TaskDef::phony()
                .depends_on(otds)
                .source(params.clone())
                .products(pairs.iter().map(|(_, hint)| hint.clone()))
                .product(cache.clone())
                .run(move |task, _| {
                    let options = Options::new()
                        .set("c", &params)
                        .set("h", &cache)
                        .set("jobs", jobs);

                    let mut invocation = task.tools().hinter.invoke().arg("hint").options(&options);
                    for (otd, hint) in &pairs {
                        invocation = invocation.arg(otd).arg(hint);
                    }

                    task.run(invocation)?;
                    Ok(())
                }))
        })
    }

    /// Instruct stages of every weight in chain order, each one declared
    /// with an edge on the previous one.
    pub fn weight_chain(&mut self) -> Result<Vec<(String, Handle)>, FontgraphError> {
        if let Some(chain) = &self.chain {
            return Ok(chain.clone());
        }

        let ctx = self.ctx;
        let mut chain: Vec<(String, Handle)> = Vec::new();

        for weight in ctx.config().hint_chain() {
            let previous = chain.last().map(|(_, handle)| *handle);
            let handle = self.instruct_stage(weight, previous)?;
            chain.push((weight.to_string(), handle));
        }

        self.chain = Some(chain.clone());
        Ok(chain)
    }

    /// The instruct stage of `weight`.
    pub fn instruct(&mut self, weight: &str) -> Result<Handle, FontgraphError> {
        self.weight_chain()?
            .into_iter()
            .find(|(name, _)| name == weight)
            .map(|(_, handle)| handle)
            .ok_or_else(|| {
                ConfigError::Unknown {
                    kind: "weight",
                    name: weight.to_string(),
                }
                .into()
            })
    }

    fn instruct_stage(&mut self, weight: &str, previous: Option<Handle>) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("instruct", [weight]), |p| {
            let analyze = p.analyze(weight)?;
            let parts = parts_for_weight(ctx.config(), weight);
            let triples = instruct_triples(ctx, &parts);
            let params = ctx.layout.hint_params(weight);

            let mut dependencies = vec![analyze];
            dependencies.extend(previous);

            Ok(TaskDef::phony()
                .depends_on(dependencies)
                .source(params.clone())
                .products(triples.iter().map(|(_, _, instr)| instr.clone()))
                .run(move |task, _| {
                    let mut invocation = task
                        .tools()
                        .hinter
                        .invoke()
                        .arg("instruct")
                        .options(&Options::new().set("c", &params));

                    for (otd, hint, instr) in &triples {
                        invocation = invocation.arg(otd).arg(hint).arg(instr);
                    }

                    task.run(invocation)?;
                    Ok(())
                }))
        })
    }

    /// A part with its instructions integrated, compiled.
    pub fn hinted(&mut self, part: &Part) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("hinted", part.params()), |p| {
            let weight = part.weight(ctx.config());
            let otd = p.unhinted_otd(part)?;
            let instruct = p.instruct(weight)?;

            let params = ctx.layout.hint_params(weight);
            let instr = hint_path(&ctx.layout, part, "instr.gz");
            let out = ctx
                .layout
                .artifact(&format!("hinted/{}", part.group()), &part.name(), "ttf");

            Ok(TaskDef::file(out)
                .depends_on((otd, instruct))
                .source(params.clone())
                .run(move |task, (otd, _)| {
                    let out = task.out()?;
                    let tmp = scratch(task, out, "otd");

                    let invocation = task
                        .tools()
                        .hinter
                        .invoke()
                        .arg("integrate")
                        .options(&Options::new().set("c", &params))
                        .arg(&instr)
                        .arg(otd.file()?)
                        .arg(&tmp);

                    task.run(invocation)?;
                    build_font(task, &tmp, out, AS_IS)?;
                    Ok(())
                }))
        })
    }
}
