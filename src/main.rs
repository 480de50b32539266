// Entry point for `tsuku`, a user-space package manager: declarative TOML
// recipes evaluate into checksummed installation plans, plans execute into
// per-version tool directories under $TSUKU_HOME, and a single state file
// remembers what is installed.

mod actions;
mod commands;
mod error;
mod libs;
mod logger;
mod schemas;
mod version;

use std::path::PathBuf;
use std::sync::OnceLock;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::commands::Runtime;
use crate::libs::cancel::CancelToken;

/// Command-line interface for tsuku.
#[derive(Parser)]
#[command(name = "tsuku", version, about = "Install CLI tools into a per-user prefix")]
struct Cli {
    /// Enables detailed debug output.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a tool from its recipe, or replay an exported plan.
    Install {
        /// Tool name (resolved under $TSUKU_HOME/recipes) or a recipe path.
        tool: String,
        /// Version spec: exact ("14.1.0"), prefix ("14.1"), or "latest".
        #[arg(long)]
        version: Option<String>,
        /// Replay a previously exported plan ("-" reads stdin). The recipe
        /// is not consulted in this mode.
        #[arg(long)]
        plan: Option<String>,
    },
    /// Evaluate a recipe into an installation plan without executing it.
    Eval {
        tool: String,
        #[arg(long)]
        version: Option<String>,
        /// Write the plan here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove an installed version (default: the active one).
    Uninstall {
        tool: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Check installed tools: version output, paths, binary integrity.
    Verify {
        /// Verify one tool; all installed tools when omitted.
        tool: Option<String>,
        /// Exit non-zero when any layer fails.
        #[arg(long)]
        strict: bool,
    },
    /// Show installed tools and versions.
    List,
    /// List the versions the recipe's upstream source offers.
    Versions { tool: String },
    /// Show recipe metadata and install state for one tool.
    Info { tool: String },
    /// Print the path the active symlink resolves to.
    Which { tool: String },
}

// SIGINT trips the cancellation token; a second interrupt falls back to
// the default handler and kills the process outright.
static INTERRUPT_TOKEN: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn handle_interrupt(_signal: libc::c_int) {
    if let Some(token) = INTERRUPT_TOKEN.get() {
        token.cancel();
    }
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

fn install_interrupt_hook(token: &CancelToken) {
    let _ = INTERRUPT_TOKEN.set(token.clone());
    let handler = handle_interrupt as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.debug);

    let runtime = Runtime::from_env();
    install_interrupt_hook(&runtime.cancel);

    let outcome = match &cli.command {
        Commands::Install { tool, version, plan } => {
            commands::install::run(&runtime, tool, version.as_deref(), plan.as_deref())
        }
        Commands::Eval { tool, version, output } => {
            commands::eval::run(&runtime, tool, version.as_deref(), output.clone())
        }
        Commands::Uninstall { tool, version } => {
            commands::uninstall::run(&runtime, tool, version.as_deref())
        }
        Commands::Verify { tool, strict } => {
            commands::verify::run(&runtime, tool.as_deref(), *strict)
        }
        Commands::List => commands::list::run(&runtime),
        Commands::Versions { tool } => commands::versions::run(&runtime, tool),
        Commands::Info { tool } => commands::info::run(&runtime, tool),
        Commands::Which { tool } => commands::which::run(&runtime, tool),
    };

    if let Err(err) = outcome {
        log_error!("{err}");
        log_debug!("error class: {}", err.kind().dimmed());
        std::process::exit(1);
    }
}
