use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{BuildConfig, MetricsPolicy};
use crate::core::Hash32;
use crate::engine::Journal;
use crate::error::{ConfigError, FontgraphError};
use crate::oracle::{Oracles, available_parallelism};
use crate::tool::{Executor, SystemExecutor};

/// Where every file of a build lives, derived from the project root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sources(&self) -> Utf8PathBuf {
        self.root.join("sources")
    }

    pub fn build(&self) -> Utf8PathBuf {
        self.root.join("build")
    }

    pub fn out(&self) -> Utf8PathBuf {
        self.root.join("out")
    }

    pub fn out_ttf(&self) -> Utf8PathBuf {
        self.out().join("ttf")
    }

    pub fn out_ttc(&self) -> Utf8PathBuf {
        self.out().join("ttc")
    }

    pub fn journal(&self) -> Utf8PathBuf {
        self.build().join(".journal.json")
    }

    pub fn recipe(&self, dir: &str, name: &str, ext: &str) -> Utf8PathBuf {
        self.root.join(dir).join(format!("{name}.{ext}"))
    }

    pub fn hint_params(&self, weight: &str) -> Utf8PathBuf {
        self.root.join("hinting-params").join(format!("{weight}.json"))
    }

    pub fn hint_cache(&self, weight: &str) -> Utf8PathBuf {
        self.build().join("hint-cache").join(format!("{weight}.gz"))
    }

    /// The multi-font source container of one weight.
    pub fn container(&self, container: &str, suffix: &str) -> Utf8PathBuf {
        self.sources()
            .join("shs")
            .join(format!("{container}-{suffix}.ttc"))
    }

    /// One region of a split container.
    pub fn split_part(&self, region: &str, weight: &str) -> Utf8PathBuf {
        self.build().join("shs").join(format!("{region}-{weight}.otf"))
    }

    /// Scratch directory the container splitter works in.
    pub fn split_scratch(&self, weight: &str) -> Utf8PathBuf {
        self.build().join("shs").join(format!(".split-{weight}"))
    }

    /// A Latin source, before outline normalisation.
    pub fn latin_source(&self, group: &str, weight: &str, cff: bool) -> Utf8PathBuf {
        let ext = if cff { "otf" } else { "ttf" };
        self.sources()
            .join(group)
            .join(format!("{group}-{weight}.{ext}"))
    }

    /// An intermediate artifact, `build/<stage>/<name>.<ext>`.
    pub fn artifact(&self, stage: &str, name: &str, ext: &str) -> Utf8PathBuf {
        self.build().join(stage).join(format!("{name}.{ext}"))
    }

    pub fn ttf_file(&self, prefix: &str, family: &str, region: &str, style: &str) -> Utf8PathBuf {
        self.out_ttf()
            .join(format!("{prefix}-{family}-{region}-{style}.ttf"))
    }

    pub fn ttc_file(&self, prefix: &str, style: &str) -> Utf8PathBuf {
        self.out_ttc().join(format!("{prefix}-{style}.ttc"))
    }

    pub fn archive(&self, prefix: &str, kind: &str, version: &str) -> Utf8PathBuf {
        self.out().join(format!("{prefix}-{kind}-{version}.7z"))
    }
}

/// Shared cancellation signal. Once raised, the runner starts no new task.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The build context handed by reference to every stage constructor and
/// every task action.
pub struct Context {
    config: Arc<BuildConfig>,
    pub layout: Layout,
    pub oracles: Oracles,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) journal: Journal,
    pub cancel: Cancel,
    pub(crate) fail_fast: bool,
    pub(crate) jobs: usize,
    metrics: MetricsPolicy,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The effective side-bearing policy, after command line overrides.
    pub fn metrics(&self) -> MetricsPolicy {
        self.metrics
    }

    pub fn version(&self) -> Result<&str, ConfigError> {
        self.oracles.version()
    }

    pub fn snapshot(&self) -> Hash32 {
        self.oracles.snapshot(&self.config.toolchain)
    }

    pub fn hint_jobs(&self) -> usize {
        self.oracles.hint_jobs()
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    root: Option<Utf8PathBuf>,
    config_path: Option<Utf8PathBuf>,
    config: Option<BuildConfig>,
    metadata_path: Option<Utf8PathBuf>,
    executor: Option<Arc<dyn Executor>>,
    jobs: Option<usize>,
    hint_jobs: Option<usize>,
    fail_fast: bool,
    recompute_metrics: bool,
}

impl ContextBuilder {
    /// Project root; defaults to the working directory.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Configuration file; defaults to `<root>/config.json`.
    pub fn config_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Uses an already parsed configuration instead of loading one.
    pub fn config(mut self, config: BuildConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Project metadata holding the version; defaults to
    /// `<root>/package.json`.
    pub fn metadata_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.metadata_path = Some(path.into());
        self
    }

    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub(crate) fn shared_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn hint_jobs(mut self, jobs: usize) -> Self {
        self.hint_jobs = Some(jobs);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn recompute_metrics(mut self, recompute: bool) -> Self {
        self.recompute_metrics = recompute;
        self
    }

    /// Loads and validates the configuration, then reads the journal of the
    /// previous run. Configuration errors surface here, before any external
    /// program has a chance to run.
    pub fn build(self) -> Result<Context, FontgraphError> {
        // Some tools run inside scratch directories, so every path handed to
        // them has to stay valid from there.
        let root = camino::absolute_utf8(self.root.unwrap_or_else(|| Utf8PathBuf::from(".")))?;

        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => {
                let path = self.config_path.unwrap_or_else(|| root.join("config.json"));
                BuildConfig::load(&path)?
            }
        };

        let metrics = if self.recompute_metrics {
            MetricsPolicy::Recompute
        } else {
            config.options.source_metrics
        };

        let layout = Layout::new(root);
        let metadata = self
            .metadata_path
            .unwrap_or_else(|| layout.root().join("package.json"));

        let journal = Journal::load(&layout.journal());

        Ok(Context {
            config: Arc::new(config),
            oracles: Oracles::new(metadata, self.hint_jobs),
            executor: self.executor.unwrap_or_else(|| Arc::new(SystemExecutor)),
            journal,
            cancel: Cancel::default(),
            fail_fast: self.fail_fast,
            jobs: self.jobs.unwrap_or_else(available_parallelism).max(1),
            metrics,
            layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{MINIMAL, parse};

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/p");
        assert_eq!(layout.journal(), "/p/build/.journal.json");
        assert_eq!(layout.hint_params("bold"), "/p/hinting-params/bold.json");
        assert_eq!(layout.hint_cache("bold"), "/p/build/hint-cache/bold.gz");
        assert_eq!(layout.split_part("sc", "bold"), "/p/build/shs/sc-bold.otf");
        assert_eq!(
            layout.ttf_file("sarasa", "gothic", "sc", "italic"),
            "/p/out/ttf/sarasa-gothic-sc-italic.ttf"
        );
        assert_eq!(layout.ttc_file("sarasa", "bold"), "/p/out/ttc/sarasa-bold.ttc");
        assert_eq!(layout.archive("sarasa", "ttf", "1.0.0"), "/p/out/sarasa-ttf-1.0.0.7z");
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let ctx = Context::builder().root(".").config(parse(MINIMAL)).build().unwrap();
        let cwd = std::env::current_dir().unwrap();

        assert!(ctx.layout.root().is_absolute());
        assert_eq!(ctx.layout.root().as_std_path(), cwd);
        assert!(ctx.layout.container("SourceHanSans", "Regular").is_absolute());
    }

    #[test]
    fn test_cli_override_of_metrics() {
        let ctx = Context::builder()
            .root("/p")
            .config(parse(MINIMAL))
            .recompute_metrics(true)
            .build()
            .unwrap();
        assert_eq!(ctx.metrics(), MetricsPolicy::Recompute);

        let ctx = Context::builder().root("/p").config(parse(MINIMAL)).build().unwrap();
        assert_eq!(ctx.metrics(), MetricsPolicy::Trust);
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = parse(MINIMAL);
        config.style_order.push("black".into());

        let result = Context::builder().root("/p").config(config).build();
        assert!(matches!(
            result,
            Err(FontgraphError::Config(ConfigError::UnknownStyle(name))) if name == "black"
        ));
    }

    #[test]
    fn test_cancel_is_shared() {
        let cancel = Cancel::default();
        let other = cancel.clone();
        other.raise();
        assert!(cancel.is_raised());
    }
}
