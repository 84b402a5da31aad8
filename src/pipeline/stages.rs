//! Unhinted stages: container split, extraction, glyph set synthesis and
//! the pass 1 composite.

use std::fs;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::MetricsPolicy;
use crate::context::Context;
use crate::engine::{Handle, Plan, TaskContext, TaskDef, TaskKey};
use crate::error::{ConfigError, FontgraphError, ToolError};
use crate::pipeline::{AS_IS, Part, Pipeline, build_font, dump_font, recipe, scratch, to_truetype};
use crate::tool::Options;

/// Spacing variant of the punctuation synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Punct {
    Wide,
    Narrow,
}

impl Punct {
    fn stage(self) -> &'static str {
        match self {
            Punct::Wide => "ws0",
            Punct::Narrow => "as0",
        }
    }

    fn recipe(self) -> &'static str {
        match self {
            Punct::Wide => "punct/ws",
            Punct::Narrow => "punct/as",
        }
    }
}

impl Pipeline<'_> {
    /// Splits the source container of `weight` into one font per region.
    ///
    /// Regions whose file is already present, left by an interrupted run,
    /// are not split again.
    pub fn split_container(&mut self, weight: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("split", [weight]), |_| {
            let config = ctx.config();
            let layout = &ctx.layout;

            let suffix = config.weight_suffix(weight)?.to_string();
            let container = layout.container(&config.source_container.container, &suffix);
            let scratch_dir = layout.split_scratch(weight);
            let parts = config
                .region_order
                .iter()
                .map(|region| Ok((config.region_part(region)?.to_string(), layout.split_part(region, weight))))
                .collect::<Result<Vec<_>, ConfigError>>()?;

            Ok(TaskDef::phony()
                .source(container.clone())
                .products(parts.iter().map(|(_, path)| path.clone()))
                .run(move |task, ()| {
                    let missing: Vec<_> = parts.iter().filter(|(_, path)| !path.exists()).collect();
                    if missing.is_empty() {
                        tracing::debug!("{container} is already split");
                        return Ok(());
                    }

                    let dir = task.temp(scratch_dir.clone());
                    fs::create_dir_all(&dir)?;
                    task.run(task.tools().otc2otf.invoke().arg(&container).cwd(&dir))?;

                    for (part, path) in missing {
                        let file = dir.join(format!("{part}-{suffix}.otf"));
                        fs::rename(&file, path)
                            .with_context(|| format!("{} did not produce '{file}'", task.tools().otc2otf.program))?;
                    }

                    Ok(())
                }))
        })
    }

    /// Font data of one region and weight of the source container.
    pub fn shs_otd(&mut self, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("shs-otd", [region, weight]), |p| {
            let split = p.split_container(weight)?;
            let part = ctx.layout.split_part(region, weight);
            let out = ctx.layout.artifact("shs", &format!("{region}-{weight}"), "otd");
            let metrics = ctx.metrics();

            Ok(TaskDef::file(out)
                .depends_on(split)
                .salt(format!("{metrics:?}"))
                .run(move |task, _| {
                    let out = task.out()?;
                    let ttf = scratch(task, out, "ttf");
                    to_truetype(task, &part, &ttf)?;

                    match metrics {
                        MetricsPolicy::Trust => dump_font(task, &ttf, out)?,
                        MetricsPolicy::Recompute => {
                            let raw = scratch(task, out, "raw.otd");
                            dump_font(task, &ttf, &raw)?;
                            recipe(task, "normalize-metrics", &Options::new().set("main", &raw).set("o", out))?;
                        }
                    }

                    Ok(())
                }))
        })
    }

    /// Non-ideographic base glyph set of a region and weight.
    pub fn non_kanji(&mut self, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        self.synthesize("non-kanji0", "non-kanji/build", region, weight)
    }

    /// Unhinted ideographs of a region and weight.
    pub fn kanji0(&mut self, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        self.synthesize("kanji0", "kanji/build", region, weight)
    }

    /// Unhinted Hangul of a region and weight.
    pub fn hangul0(&mut self, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        self.synthesize("hangul0", "hangul/build", region, weight)
    }

    fn synthesize(
        &mut self,
        stage: &'static str,
        name: &'static str,
        region: &str,
        weight: &str,
    ) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new(stage, [region, weight]), |p| {
            let otd = p.shs_otd(region, weight)?;
            let out = ctx.layout.artifact(stage, &format!("{region}-{weight}"), "ttf");

            Ok(TaskDef::file(out).depends_on(otd).run(move |task, otd| {
                let out = task.out()?;
                let tmp = scratch(task, out, "otd");
                recipe(task, name, &Options::new().set("main", otd.file()?).set("o", &tmp))?;
                build_font(task, &tmp, out, AS_IS)?;
                Ok(())
            }))
        })
    }

    /// Wide punctuation of a family, region and canonical weight.
    pub fn ws0(&mut self, family: &str, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        self.punct(Punct::Wide, family, region, weight)
    }

    /// Narrow punctuation of a family, region and canonical weight.
    pub fn as0(&mut self, family: &str, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        self.punct(Punct::Narrow, family, region, weight)
    }

    fn punct(&mut self, kind: Punct, family: &str, region: &str, weight: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;
        // Italic punctuation comes from the upright one in pass 1.
        let weight = ctx.config().deitalized(weight);

        self.ensure(TaskKey::new(kind.stage(), [family, region, weight]), |p| {
            let flags = ctx.config().family(family)?;
            let base = p.non_kanji(region, weight)?;
            let out = ctx
                .layout
                .artifact(kind.stage(), &format!("{family}-{region}-{weight}"), "ttf");

            let options = Options::new()
                .set("mono", flags.is_mono)
                .set("type", flags.is_type)
                .set("pwid", flags.is_pwid)
                .set("term", flags.is_term);

            Ok(TaskDef::file(out)
                .depends_on(base)
                .salt(options.to_args().join(" "))
                .run(move |task, base| {
                    let out = task.out()?;
                    let tmp = scratch(task, out, "otd");
                    let options = options.clone().set("main", base.file()?).set("o", &tmp);
                    recipe(task, kind.recipe(), &options)?;
                    build_font(task, &tmp, out, AS_IS)?;
                    Ok(())
                }))
        })
    }

    /// Latin glyphs of a group and style, with TrueType outlines.
    pub fn latin_source(&mut self, group: &str, style: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("latin", [group, style]), |_| {
            let cff = ctx.config().latin_group(group)?.is_cff;
            let source = ctx.layout.latin_source(group, style, cff);
            let out = ctx.layout.artifact("latin", &format!("{group}-{style}"), "ttf");

            Ok(TaskDef::file(out)
                .source(source.clone())
                .salt(cff)
                .run(move |task, ()| {
                    let out = task.out()?;
                    if cff {
                        to_truetype(task, &source, out)?;
                    } else {
                        fs::copy(&source, out)?;
                    }
                    Ok(())
                }))
        })
    }

    /// First composite: Latin and both punctuation sets merged, italics
    /// synthesized where the style asks for it, then sanitized.
    pub fn pass1(&mut self, family: &str, region: &str, style: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("pass1", [family, region, style]), |p| {
            let config = ctx.config();
            let group = config.family(family)?.latin_group.clone();
            let subfamily = config.region(region)?.name.clone();
            let weight = config.deitalized(style);

            let latin = p.latin_source(&group, style)?;
            let asian = p.as0(family, region, weight)?;
            let ws = p.ws0(family, region, weight)?;

            let out = ctx
                .layout
                .artifact("pass1", &format!("{family}-{region}-{style}"), "ttf");

            let names = Options::new()
                .set("family", format!("{} {family}", config.prefix))
                .set("subfamily", subfamily)
                .set("style", style)
                .set("italize", config.is_italized(style));
            let autohint = config.options.autohint_pass1;

            Ok(TaskDef::file(out)
                .depends_on((latin, asian, ws))
                .salt(names.to_args().join(" "))
                .salt(autohint)
                .run(move |task, (latin, asian, ws)| {
                    let out = task.out()?;
                    let otd = scratch(task, out, "otd");
                    let options = Options::new()
                        .set("main", latin.file()?)
                        .set("asian", asian.file()?)
                        .set("ws", ws.file()?)
                        .set("o", &otd);

                    recipe(task, "pass1/index", &options.extend(&names))?;

                    let raw = scratch(task, out, "raw.ttf");
                    build_font(task, &otd, &raw, AS_IS)?;
                    sanitize(task, &raw, out, autohint)?;
                    Ok(())
                }))
        })
    }

    /// The unhinted font of a part.
    pub fn unhinted(&mut self, part: &Part) -> Result<Handle, FontgraphError> {
        match part {
            Part::Pass1 {
                family,
                region,
                style,
            } => self.pass1(family, region, style),
            Part::Kanji { region, weight } => self.kanji0(region, weight),
            Part::Hangul { region, weight } => self.hangul0(region, weight),
        }
    }

    /// Font data of the unhinted font of a part, the input of the hint
    /// engine.
    pub fn unhinted_otd(&mut self, part: &Part) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("unhinted-otd", part.params()), |p| {
            let font = p.unhinted(part)?;
            let out = unhinted_otd_path(ctx, part);

            Ok(TaskDef::file(out).depends_on(font).run(|task, font| {
                dump_font(task, font.file()?, task.out()?)?;
                Ok(())
            }))
        })
    }
}

pub(crate) fn unhinted_otd_path(ctx: &Context, part: &Part) -> Utf8PathBuf {
    ctx.layout
        .artifact(&format!("unhinted/{}", part.group()), &part.name(), "otd")
}

/// Round trip through the XML interchange format, then optionally
/// auto-hint.
fn sanitize(task: &TaskContext, font: &Utf8Path, out: &Utf8Path, autohint: bool) -> Result<(), ToolError> {
    let ttx = scratch(task, out, "ttx");
    let tool = &task.tools().ttx;

    task.run(tool.invoke().args(["-q", "-o"]).arg(&ttx).arg(font))?;

    if autohint {
        let plain = scratch(task, out, "plain.ttf");
        task.run(tool.invoke().args(["-q", "-o"]).arg(&plain).arg(&ttx))?;
        task.run(task.tools().ttfautohint.invoke().arg(&plain).arg(out))
    } else {
        task.run(tool.invoke().args(["-q", "-o"]).arg(out).arg(&ttx))
    }
}
