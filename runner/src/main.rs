mod app;
mod buildenv;
mod config;
mod container;
mod executors;
mod implementation;
mod matrix;
mod orchestrator;
mod probe;
mod process;
mod results;

use crate::{
    app::{ApplicationConfig, TestCategory},
    config::{load_ofi, load_registry, Context, Distro, SigningKey, ToolConfig, Workspace},
    container::MpiModel,
    matrix::Matrix,
    orchestrator::Orchestrator,
};
use clap::{Args, Parser, Subcommand};
use std::{fmt::Display, path::PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Test MPI compatibility between host and container")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log everything and check that the required tools are installed
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the host/container matrix of one test category
    Run(RunArgs),
    /// Combine the results of the three categories into the compatibility matrix
    Aggregate(AggregateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// File listing the MPI releases to test, one download URL per line
    #[arg(short, long)]
    config: PathBuf,

    /// Results file, defaults to `<implementation>-<category>-results.txt`
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// YAML description of the test application, overrides the built-in one
    #[arg(long)]
    app_config: Option<PathBuf>,

    /// Run the point-to-point test instead of hello world
    #[arg(long, conflicts_with = "imb")]
    netpipe: bool,

    /// Run the collectives test instead of hello world
    #[arg(long)]
    imb: bool,

    /// Number of times each experiment is run
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    nrun: u32,

    /// Keep MPI installations and images in the workspace for later runs
    #[arg(long)]
    persistent: bool,

    /// Linux distribution of the images, as `name:codename`
    #[arg(long)]
    distro: Option<Distro>,

    #[arg(long, value_enum, default_value_t = MpiModel::Hybrid)]
    model: MpiModel,

    /// Number of MPI ranks per job
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    ranks: u32,

    /// Number of nodes per batch job
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    nodes: u32,

    /// Registry the images are pushed to after being built
    #[arg(long)]
    push: Option<String>,
}

#[derive(Args, Debug)]
struct AggregateArgs {
    /// MPI implementation the results belong to (openmpi, mpich, intel)
    #[arg(short, long)]
    implementation: String,

    /// Directory holding the results files
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Matrix file, defaults to `<dir>/<implementation>-compatibility.txt`
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// log `error` and terminate, for failures that leave nothing to run
fn fatal<T, E: Display>(result: Result<T, E>, message: &str) -> T {
    match result {
        Ok(value) => value,
        Err(error) => {
            error!(error = %error, "{message}");
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run(args: RunArgs, debug: bool) {
    let workspace = fatal(Workspace::from_env(), "Failed to locate the workspace");
    info!(workspace = ?workspace.root, "Using workspace");

    let tool = fatal(
        ToolConfig::load_or_probe(
            &workspace.tool_config_path(),
            &workspace.layout().scratch_dir("probe"),
        ),
        "Failed to load the tool configuration",
    );

    if debug {
        fatal(
            probe::check_prerequisites(&tool.container_engine),
            "Host is missing prerequisites",
        );
    }

    let ofi = fatal(load_ofi(&workspace.ofi_config_path()), "Failed to load OFI settings");
    let image_registry = fatal(
        load_registry(&workspace.registry_config_path()),
        "Failed to load the image registry",
    );
    let signing = fatal(SigningKey::from_env(), "Failed to read the signing key");

    let matrix = fatal(Matrix::load(&args.config), "Failed to load the matrix");

    let category = if args.netpipe {
        TestCategory::Netpipe
    } else if args.imb {
        TestCategory::Imb
    } else {
        TestCategory::Init
    };
    let app = match args.app_config {
        Some(ref path) => {
            let app = fatal(
                ApplicationConfig::load(path),
                "Failed to load the application configuration",
            );
            if app.category != category {
                warn!(
                    requested = %category,
                    configured = %app.category,
                    "Using the category of the application configuration"
                );
            }
            app
        }
        None => ApplicationConfig::builtin(category),
    };

    let output = args.output.unwrap_or_else(|| {
        PathBuf::from(results::results_file_name(matrix.implementation, app.category))
    });

    let mut ctx = Context::new(tool, workspace);
    ctx.distro = args.distro.unwrap_or_default();
    ctx.model = args.model;
    ctx.persistent = args.persistent;
    ctx.nrun = args.nrun as usize;
    ctx.ranks = args.ranks as usize;
    ctx.nodes = args.nodes as usize;
    ctx.signing = signing;
    ctx.push_registry = args.push;
    ctx.ofi = ofi;
    ctx.image_registry = image_registry;

    info!(
        implementation = %matrix.implementation,
        versions = matrix.releases.len(),
        category = %app.category,
        model = %ctx.model,
        output = ?output,
        "Starting experiments"
    );

    let summary = fatal(
        Orchestrator::new(&ctx, &matrix, &app, output).run(),
        "Failed to update the results",
    );
    info!("{summary}");
}

fn aggregate(args: AggregateArgs) {
    let implementation = fatal(
        implementation::lookup(&args.implementation),
        "Unknown MPI implementation",
    );

    let [init, netpipe, imb] = [TestCategory::Init, TestCategory::Netpipe, TestCategory::Imb]
        .map(|category| {
            let path = args
                .dir
                .join(results::results_file_name(implementation, category));
            if !path.exists() {
                warn!(path = ?path, "No results for {category}, its pairs count as failed");
            }
            fatal(results::load(&path), "Failed to load results")
        });

    let entries = results::aggregate(&init, &netpipe, &imb);
    let output = args
        .output
        .unwrap_or_else(|| args.dir.join(results::matrix_file_name(implementation)));
    fatal(
        results::write_matrix(&output, &entries),
        "Failed to write the compatibility matrix",
    );

    info!(
        output = ?output,
        pairs = entries.len(),
        compatible = entries.iter().filter(|entry| entry.compatible).count(),
        "Wrote compatibility matrix"
    );
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Run(args) => run(args, cli.debug),
        Commands::Aggregate(args) => aggregate(args),
    }
}
