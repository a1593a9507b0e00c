mod commands;
mod config;
mod logging;
mod serve;
mod service;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use crate::commands::run::RunArgs;
use crate::commands::verify::VerifyArgs;
use crate::config::Settings;
use crate::service::ServiceError;

/// Compensation plan engine.
#[derive(Parser)]
#[command(name = "payplan", version, about = "Compensation plan engine")]
struct Cli {
    /// Path to a payplan.toml configuration file
    #[arg(long, global = true, env = "PAYPLAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a plan file, or one expression against it
    Validate {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Expression to check instead of the whole plan
        #[arg(long)]
        expression: Option<String>,
        /// Check the expression as if it were this step
        #[arg(long, requires = "expression")]
        step_order: Option<u32>,
    },

    /// Execute a plan against a batch of employees
    Run {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Path to the batch JSON file
        #[arg(long)]
        employees: PathBuf,
        /// Precision mode name
        #[arg(long)]
        precision: Option<String>,
        /// Stop the run at the first failing employee
        #[arg(long)]
        strict: bool,
        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print the snapshot hash of a plan
    Hash {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Precision mode name
        #[arg(long)]
        precision: Option<String>,
    },

    /// Check a plan against a previously recorded snapshot hash
    Verify {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Expected snapshot hash
        #[arg(long)]
        expected: String,
        /// Run JSON recorded with the expected hash
        #[arg(long)]
        run: Option<PathBuf>,
        /// Precision mode name
        #[arg(long)]
        precision: Option<String>,
    },

    /// Start the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
        /// Plan JSON files to pre-load
        #[arg()]
        plans: Vec<PathBuf>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => process::exit(commands::fail(&ServiceError::from(e))),
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: could not start the async runtime: {}", e);
            process::exit(1);
        }
    };

    let code = rt.block_on(dispatch(cli.command, settings));
    process::exit(code);
}

async fn dispatch(command: Commands, settings: Settings) -> i32 {
    match command {
        Commands::Serve { port, plans } => {
            if let Err(e) = serve::start_server(port, plans, settings).await {
                eprintln!("Server error: {}", e);
                return 1;
            }
            0
        }
        Commands::Validate {
            plan,
            expression,
            step_order,
        } => {
            let svc = commands::service(settings);
            commands::validate::cmd_validate(&svc, &plan, expression, step_order).await
        }
        Commands::Run {
            plan,
            employees,
            precision,
            strict,
            workers,
        } => {
            let svc = commands::service(settings);
            let args = RunArgs {
                plan,
                employees,
                precision,
                strict,
                workers,
            };
            commands::run::cmd_run(&svc, args).await
        }
        Commands::Hash { plan, precision } => {
            let svc = commands::service(settings);
            commands::hash::cmd_hash(&svc, &plan, precision.as_deref()).await
        }
        Commands::Verify {
            plan,
            expected,
            run,
            precision,
        } => {
            let svc = commands::service(settings);
            let args = VerifyArgs {
                plan,
                expected,
                run,
                precision,
            };
            commands::verify::cmd_verify(&svc, args).await
        }
    }
}
