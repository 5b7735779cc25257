use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use ob_fixup_run::engine::run_iterative_fixup;
use ob_fixup_run::recompile::recompile_invalid_objects;
use ob_fixup_run::report::render_run_summary;
use ob_fixup_run::scheduler::collect_scripts;
use ob_fixup_run::view_chain::run_view_chain;
use ob_fixup_run::{FixupConfig, ObClientExecutor, RunContext};

#[derive(Parser)]
#[clap(name = "ob-fixup-run", version, about = "Apply fixup scripts to an OceanBase target in dependency order")]
struct Cli {
    /// TOML configuration file
    #[clap(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Fixup script root, overrides the configuration
    #[clap(short, long, parse(from_os_str))]
    root: Option<PathBuf>,

    /// Run grants ahead of the views and code that need them
    #[clap(long)]
    smart: bool,

    #[clap(long)]
    max_rounds: Option<usize>,

    /// Debug logging for this crate
    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every pending script, round after round, then recompile
    Run {
        #[clap(long)]
        no_recompile: bool,
    },
    /// Print the scripts in execution order without running anything
    Plan,
    /// Build and execute per-view plans from the latest chain report
    ViewChain,
    /// Only recompile invalid objects
    Recompile,
}

fn load_config(cli: &Cli) -> anyhow::Result<FixupConfig> {
    let mut config = match &cli.config {
        Some(path) => FixupConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FixupConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.fixup.root = root.clone();
    }
    if cli.smart {
        config.fixup.smart_order = true;
    }
    if let Some(max_rounds) = cli.max_rounds {
        config.fixup.max_rounds = max_rounds;
    }
    Ok(config)
}

fn main() {
    let cli: Cli = Cli::parse();
    let directive = if cli.verbose {
        "ob_fixup_run=debug"
    } else {
        "ob_fixup_run=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let root = config.fixup.root.clone();
    if !root.exists() {
        anyhow::bail!("fixup root {} does not exist", root.display());
    }

    match cli.command {
        Command::Plan => {
            let scripts = collect_scripts(&root, &config.scan_options())?;
            println!("{} scripts under {}", scripts.len(), root.display());
            for script in scripts {
                println!("{:>4}  {}", script.layer, script.relative.display());
            }
            Ok(0)
        }
        Command::Run { no_recompile } => {
            let executor: ObClientExecutor = config.target.executor();
            let recompile = config.recompile.clone();
            let mut ctx = RunContext::new(config, executor);
            let outcome = run_iterative_fixup(&mut ctx)?;
            info!(stop = ?outcome.stop_reason, "fixup rounds finished");

            let recompiled = if recompile.enabled && !no_recompile {
                let result = recompile_invalid_objects(
                    &ctx.executor,
                    &recompile.owners,
                    ctx.config.statement_timeout(),
                    recompile.max_retries,
                )
                .context("recompiling invalid objects")?;
                ctx.counters.recompiled += result.0;
                Some(result)
            } else {
                None
            };
            print!("{}", render_run_summary(&outcome, &ctx.counters, recompiled));
            Ok(outcome.exit_code())
        }
        Command::ViewChain => {
            let executor = config.target.executor();
            let mut ctx = RunContext::new(config, executor);
            let outcome = run_view_chain(&mut ctx)?;
            println!("report: {}", outcome.report.display());
            println!("plans:  {}", outcome.plan_dir.display());
            for (view, status) in &outcome.statuses {
                println!("{:<8} {}", status.to_string(), view);
            }
            for (status, count) in outcome.counts() {
                println!("{}: {}", status, count);
            }
            Ok(outcome.exit_code())
        }
        Command::Recompile => {
            let executor = config.target.executor();
            let (done, left) = recompile_invalid_objects(
                &executor,
                &config.recompile.owners,
                config.statement_timeout(),
                config.recompile.max_retries,
            )
            .context("recompiling invalid objects")?;
            println!("recompiled {}, {} still invalid", done, left);
            Ok(if left == 0 { 0 } else { 1 })
        }
    }
}
