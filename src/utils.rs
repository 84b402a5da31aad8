use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_BAR: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.cyan} [{elapsed}] {msg}")
        .expect("Error setting task spinner template")
});

/// Style of the overall progress bar.
pub(crate) fn get_style_bar() -> ProgressStyle {
    STYLE_BAR.clone()
}

/// Style of the spinner shown for each running task.
pub(crate) fn get_style_task() -> ProgressStyle {
    STYLE_TASK.clone()
}

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Installs the log subscriber, with log lines routed around the progress
/// bars. `RUST_LOG` takes precedence over `verbose`.
#[cfg(feature = "logging")]
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}

#[cfg(not(feature = "logging"))]
pub fn init_logging(_: bool) -> anyhow::Result<()> {
    Ok(())
}
