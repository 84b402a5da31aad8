//! Final composites and the two distributions.

use std::fs;
use std::io::ErrorKind;

use anyhow::Context as _;
use camino::Utf8Path;

use crate::config::BuildConfig;
use crate::engine::{Handle, Plan, TaskContext, TaskDef, TaskKey};
use crate::error::FontgraphError;
use crate::pipeline::{OPTIMIZE, Part, Pipeline, build_font, recipe};
use crate::tool::Options;

/// File names of the per-file distribution, cut into one archiving batch
/// per upright and italic style pair. Within a batch the two styles of a
/// family and region sit next to each other, which is what lets the
/// archiver find the redundancy between them.
pub fn archive_batches(config: &BuildConfig) -> Vec<Vec<String>> {
    config
        .style_pairs()
        .into_iter()
        .map(|(upright, italic)| {
            let mut batch = Vec::new();
            for family in &config.family_order {
                for region in &config.region_order {
                    for style in std::iter::once(upright).chain(italic) {
                        batch.push(format!("{}-{family}-{region}-{style}.ttf", config.prefix));
                    }
                }
            }
            batch
        })
        .collect()
}

fn ttc_names(config: &BuildConfig) -> Vec<String> {
    config
        .style_order
        .iter()
        .map(|style| format!("{}-{style}.ttc", config.prefix))
        .collect()
}

impl Pipeline<'_> {
    /// Second composite: hinted pass 1 merged with the hinted ideographs and
    /// Hangul of the same region and weight.
    pub fn pass2(&mut self, family: &str, region: &str, style: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("pass2", [family, region, style]), |p| {
            let config = ctx.config();
            let weight = config.deitalized(style).to_string();
            let italize = config.is_italized(style);

            let main = p.hinted(&Part::Pass1 {
                family: family.to_string(),
                region: region.to_string(),
                style: style.to_string(),
            })?;
            let kanji = p.hinted(&Part::Kanji {
                region: region.to_string(),
                weight: weight.clone(),
            })?;
            let hangul = p.hinted(&Part::Hangul {
                region: region.to_string(),
                weight,
            })?;

            let out = ctx
                .layout
                .artifact("pass2", &format!("{family}-{region}-{style}"), "otd");

            Ok(TaskDef::file(out)
                .depends_on((main, kanji, hangul))
                .salt(italize)
                .run(move |task, (main, kanji, hangul)| {
                    let options = Options::new()
                        .set("main", main.file()?)
                        .set("kanji", kanji.file()?)
                        .set("hangul", hangul.file()?)
                        .set("o", task.out()?)
                        .set("italize", italize);

                    recipe(task, "pass2/build", &options)?;
                    Ok(())
                }))
        })
    }

    /// A distributed font, `out/ttf/<prefix>-<family>-<region>-<style>.ttf`.
    pub fn ttf_file(&mut self, family: &str, region: &str, style: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("ttf", [family, region, style]), |p| {
            let pass2 = p.pass2(family, region, style)?;
            let out = ctx
                .layout
                .ttf_file(&ctx.config().prefix, family, region, style);

            Ok(TaskDef::file(out).depends_on(pass2).run(|task, pass2| {
                build_font(task, pass2.file()?, task.out()?, OPTIMIZE)?;
                Ok(())
            }))
        })
    }

    /// The whole per-file matrix.
    pub fn ttf_files(&mut self) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new::<_, &str>("ttf-files", []), |p| {
            let config = ctx.config();
            let mut files = Vec::new();

            for style in &config.style_order {
                for family in &config.family_order {
                    for region in &config.region_order {
                        files.push(p.ttf_file(family, region, style)?);
                    }
                }
            }

            Ok(TaskDef::phony().depends_on(files).run(|_, _| Ok(())))
        })
    }

    /// A container with every family and region of one style,
    /// `out/ttc/<prefix>-<style>.ttc`.
    pub fn ttc_file(&mut self, style: &str) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new("ttc", [style]), |p| {
            let config = ctx.config();
            let mut fonts = Vec::new();

            for family in &config.family_order {
                for region in &config.region_order {
                    fonts.push(p.ttf_file(family, region, style)?);
                }
            }

            let out = ctx.layout.ttc_file(&config.prefix, style);

            Ok(TaskDef::file(out).depends_on(fonts).run(|task, fonts| {
                let mut invocation = task.tools().otf2otc.invoke().arg("-o").arg(task.out()?);
                for font in fonts {
                    invocation = invocation.arg(font.file()?);
                }

                task.run(invocation)?;
                Ok(())
            }))
        })
    }

    pub fn ttc_files(&mut self) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;

        self.ensure(TaskKey::new::<_, &str>("ttc-files", []), |p| {
            let files = ctx
                .config()
                .style_order
                .iter()
                .map(|style| p.ttc_file(style))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(TaskDef::phony().depends_on(files).run(|_, _| Ok(())))
        })
    }

    /// `out/<prefix>-ttf-<version>.7z`
    pub fn ttf_archive(&mut self) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;
        let version = ctx.version()?.to_string();

        self.ensure(TaskKey::new("ttf-archive", [&version]), |p| {
            let files = p.ttf_files()?;
            let config = ctx.config();
            let out = ctx.layout.archive(&config.prefix, "ttf", &version);
            let batches = archive_batches(config);

            Ok(TaskDef::file(out).depends_on(files).run(move |task, _| {
                archive(task, &task.layout().out_ttf(), &batches)
            }))
        })
    }

    /// `out/<prefix>-ttc-<version>.7z`
    pub fn ttc_archive(&mut self) -> Result<Handle, FontgraphError> {
        let ctx = self.ctx;
        let version = ctx.version()?.to_string();

        self.ensure(TaskKey::new("ttc-archive", [&version]), |p| {
            let files = p.ttc_files()?;
            let config = ctx.config();
            let out = ctx.layout.archive(&config.prefix, "ttc", &version);
            let batches = vec![ttc_names(config)];

            Ok(TaskDef::file(out).depends_on(files).run(move |task, _| {
                archive(task, &task.layout().out_ttc(), &batches)
            }))
        })
    }
}

/// Compresses `batches` of files from `dir` into the task's archive,
/// starting from scratch.
fn archive(task: &TaskContext, dir: &Utf8Path, batches: &[Vec<String>]) -> anyhow::Result<()> {
    let out = task.out()?;

    match fs::remove_file(out) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("couldn't remove old archive '{out}'")),
    }

    let name = out.file_name().context("archive path has no file name")?;
    let tools = task.tools();

    for batch in batches {
        let invocation = tools
            .archiver
            .invoke()
            .arg("a")
            .args(&tools.archive_args)
            .arg(format!("../{name}"))
            .args(batch)
            .cwd(dir);

        task.run(invocation)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{MINIMAL, TWO_WEIGHTS, parse};

    #[test]
    fn test_batches_pair_upright_with_italic() {
        let config = parse(MINIMAL);
        assert_eq!(
            archive_batches(&config),
            vec![vec![
                "sarasa-gothic-sc-regular.ttf".to_string(),
                "sarasa-gothic-sc-italic.ttf".to_string(),
            ]]
        );
    }

    #[test]
    fn test_batches_cover_the_matrix_once() {
        let config = parse(TWO_WEIGHTS);
        let batches = archive_batches(&config);
        assert_eq!(batches.len(), 3);

        let mut names: Vec<_> = batches.into_iter().flatten().collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(total, names.len());
        assert_eq!(total, 2 * 2 * 6);
    }

    #[test]
    fn test_ttc_names_follow_style_order() {
        let config = parse(MINIMAL);
        assert_eq!(ttc_names(&config), vec!["sarasa-regular.ttc", "sarasa-italic.ttc"]);
    }
}
