use std::process::ExitCode;
use std::time::Instant;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use fontgraph::{Context, FontgraphError, Layout, Request, as_overhead};

/// Assembles the font matrix described by `config.json`.
#[derive(Parser, Debug)]
#[command(name = "fontgraph", version, about)]
struct Cli {
    /// Project root.
    #[arg(long, global = true, default_value = ".")]
    root: Utf8PathBuf,

    /// Configuration file, defaults to `<root>/config.json`.
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Number of tasks run at the same time.
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Stop starting new tasks after the first failure.
    #[arg(long, global = true)]
    fail_fast: bool,

    /// Recompute side bearings instead of trusting the source fonts.
    #[arg(long, global = true)]
    recompute_metrics: bool,

    /// Enable debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Both distributions and their archives.
    All,
    /// The per-file distribution and its archive.
    Ttf,
    /// The font collections and their archive.
    Ttc,
    /// A single font.
    One(OneArgs),
    /// Print the task graph of a target as Mermaid without running it.
    Graph {
        #[command(subcommand)]
        target: Option<Target>,
    },
    /// Remove `build/` and `out/`.
    Clean,
}

#[derive(Subcommand, Debug, Clone)]
enum Target {
    All,
    Ttf,
    Ttc,
    One(OneArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct OneArgs {
    family: String,
    region: String,
    style: String,
}

impl From<OneArgs> for Request {
    fn from(args: OneArgs) -> Self {
        Request::One {
            family: args.family,
            region: args.region,
            style: args.style,
        }
    }
}

impl From<Target> for Request {
    fn from(target: Target) -> Self {
        match target {
            Target::All => Request::All,
            Target::Ttf => Request::Ttf,
            Target::Ttc => Request::Ttc,
            Target::One(args) => args.into(),
        }
    }
}

enum Action {
    Build(Request),
    Graph(Request),
    Clean,
}

impl From<Option<Command>> for Action {
    fn from(command: Option<Command>) -> Self {
        match command.unwrap_or(Command::All) {
            Command::All => Action::Build(Request::All),
            Command::Ttf => Action::Build(Request::Ttf),
            Command::Ttc => Action::Build(Request::Ttc),
            Command::One(args) => Action::Build(args.into()),
            Command::Graph { target } => Action::Graph(target.map_or(Request::All, Request::from)),
            Command::Clean => Action::Clean,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    fontgraph::init_logging(cli.verbose)?;

    let request = match Action::from(cli.command) {
        Action::Clean => {
            fontgraph::clean(&Layout::new(cli.root))?;
            return Ok(ExitCode::SUCCESS);
        }
        Action::Graph(request) => {
            let ctx = context(cli.root, cli.config, cli.jobs, cli.fail_fast, cli.recompute_metrics)?;
            let (pipeline, _) = fontgraph::plan(&ctx, &request)?;
            print!("{}", pipeline.tasks());
            return Ok(ExitCode::SUCCESS);
        }
        Action::Build(request) => request,
    };

    let ctx = context(cli.root, cli.config, cli.jobs, cli.fail_fast, cli.recompute_metrics)?;

    let start = Instant::now();
    let report = fontgraph::build(&ctx, &request)?;

    eprintln!("{report} {}", as_overhead(start));

    for (key, time) in report.slowest(5) {
        tracing::debug!("{key} took {}ms", time.as_millis());
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn context(
    root: Utf8PathBuf,
    config: Option<Utf8PathBuf>,
    jobs: Option<usize>,
    fail_fast: bool,
    recompute_metrics: bool,
) -> Result<Context, FontgraphError> {
    let mut builder = Context::builder()
        .root(root)
        .fail_fast(fail_fast)
        .recompute_metrics(recompute_metrics);

    if let Some(path) = config {
        builder = builder.config_path(path);
    }
    if let Some(jobs) = jobs {
        builder = builder.jobs(jobs);
    }

    builder.build()
}
