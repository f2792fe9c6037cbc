use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use mdrun::reporting::{print_run_statistics, report_failures};
use mdrun::{Runner, RunnerConfig};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mdrun", version)]
#[command(about = "Run the fenced code examples in markdown documents", long_about = None)]
struct Cli {
    /// Markdown sources to check
    #[arg(
        short,
        long,
        env = "MDRUN_SOURCES",
        value_delimiter = ',',
        num_args = 1..,
        default_value = "README.md",
        global = true
    )]
    sources: Vec<PathBuf>,

    /// Expected number of examples; 0 disables the check
    #[arg(short, long, env = "MDRUN_COUNT", default_value_t = 0, global = true)]
    count: usize,

    /// Configuration file (defaults to ./mdrun.toml, then the user config dir)
    #[arg(short = 'C', long, env = "MDRUN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(
        short = 'D',
        long,
        env = "MDRUN_DEBUG",
        value_parser = clap::builder::FalseyValueParser::new(),
        global = true
    )]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the examples to files instead of running them
    Extract {
        /// Directory receiving the files (defaults to the system temp dir)
        #[arg(short, long, env = "MDRUN_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },
    /// List the fence tags that have a frob
    ListFrobs,
    /// Print the language table, configured aliases included, as JSON
    DumpLanguages,
}

pub fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            exit(2);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {:#}", e);
        exit(2);
    }
}

fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_module("mdrun", LevelFilter::Debug);
    }
    builder.init();
}

fn build_runner(sources: Vec<PathBuf>, count: usize, config: &RunnerConfig) -> Runner {
    let expected_count = (count > 0).then_some(count);
    Runner::new(
        sources,
        expected_count,
        Arc::new(config.languages()),
        config.frobs(),
    )
}

async fn run(cli: Cli) -> Result<()> {
    let config = RunnerConfig::load_default(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Extract { output_dir }) => {
            let dir = output_dir.unwrap_or_else(std::env::temp_dir);
            let written = build_runner(cli.sources, cli.count, &config)
                .extract(&dir)
                .await
                .context("Failed to extract examples")?;
            for path in written {
                println!("{}", path.display());
            }
            Ok(())
        }
        Some(Commands::ListFrobs) => {
            for alias in build_runner(cli.sources, cli.count, &config).known_aliases() {
                println!("{}", alias);
            }
            Ok(())
        }
        Some(Commands::DumpLanguages) => {
            let json = config
                .languages()
                .to_json()
                .context("Failed to serialize languages")?;
            println!("{}", json);
            Ok(())
        }
        None => {
            let summary = build_runner(cli.sources, cli.count, &config)
                .run_summary()
                .await;
            if summary.is_success() {
                print_run_statistics(&summary);
                return Ok(());
            }
            report_failures(&summary);
            let failures = summary.into_errors().len();
            anyhow::bail!("{} example error(s)", failures);
        }
    }
}
