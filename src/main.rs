//! BUILDER - Polyglot Build Orchestrator
//!
//! Main entry point. Parses the command line, initializes logging, and
//! dispatches to the command layer. Language handlers are registered by
//! embedders through the library API; the bare CLI ships with an empty
//! registry.

use builder::commands;
use builder::core::config;
use builder::core::BuildOptions;
use builder::exec::HandlerRegistry;
use clap::{Parser, Subcommand};
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "builder",
    version,
    about = "Polyglot zero-configuration build orchestrator"
)]
struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the workspace, or a single target's dependency closure
    Build {
        /// Target label, e.g. //app:main
        target: Option<String>,

        /// Worker thread count (defaults to CPU count)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Stop dispatching after the first failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Resume an interrupted build from its checkpoint
    Resume {
        /// Target label, e.g. //app:main
        target: Option<String>,
    },

    /// Delete the cache and output directories
    Clean,

    /// Print the topological order and dependency edges
    Graph {
        /// Target label to restrict to
        target: Option<String>,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a query expression, e.g. deps(//app:main)
    Query {
        /// The expression
        expr: String,
    },

    /// Dry-run target inference
    Infer {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // Panic hook for better error reporting
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("BUILDER Fatal Error:");
        eprintln!("{}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!(
                "Location: {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
    }));

    // Logging: RUST_LOG wins, BUILDER_VERBOSE bumps the default to debug
    let default_filter = if config::verbose_from_env() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let cli = Cli::parse();
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    log::info!("BUILDER v{}", builder::VERSION);
    log::debug!("Workspace: {}", workspace.display());

    // Handlers are external collaborators; embedders register them through
    // the library API.
    let registry = Arc::new(HandlerRegistry::new());
    if registry.languages().is_empty() {
        log::debug!("No language handlers registered");
    }

    let exit = match cli.command {
        Command::Build {
            target,
            jobs,
            fail_fast,
        } => {
            let mut options = BuildOptions::from_env();
            if let Some(jobs) = jobs {
                options.workers = jobs.max(1);
            }
            options.fail_fast = fail_fast;
            let summary = commands::build(&workspace, registry, options, target.as_deref())?;
            println!("{}", summary);
            i32::from(!summary.success())
        }
        Command::Resume { target } => {
            let options = BuildOptions::from_env();
            let summary = commands::resume(&workspace, registry, options, target.as_deref())?;
            println!("{}", summary);
            i32::from(!summary.success())
        }
        Command::Clean => {
            commands::clean(&workspace, &BuildOptions::from_env())?;
            0
        }
        Command::Graph { target, json } => {
            let report = commands::graph_report(&workspace, &registry, target.as_deref(), json)?;
            print!("{}", report);
            0
        }
        Command::Query { expr } => {
            let ids = commands::query(&workspace, &registry, &expr)?;
            for id in ids {
                println!("{}", id);
            }
            0
        }
        Command::Infer { json } => {
            let report = commands::infer_report(&workspace, &registry, json)?;
            print!("{}", report);
            0
        }
    };

    if exit != 0 {
        std::process::exit(exit);
    }
    Ok(())
}
