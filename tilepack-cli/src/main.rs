//! Tilepack CLI - command-line interface
//!
//! Exposes the tilepack library over a set of subcommands. Every package
//! operation runs in a worker: a background task by default, or a child
//! process (this same binary's hidden `worker` subcommand) with `--ipc`.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::{demo, export, features, list, tile, worker};

#[derive(Parser)]
#[command(
    name = "tilepack",
    version,
    about = "Worker-isolated access to geospatial tile and feature packages"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run package operations in a separate worker process
    #[arg(long, global = true)]
    ipc: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List the tables in a package
    List(list::ListArgs),
    /// Fetch one rendered tile from a package
    Tile(tile::TileArgs),
    /// Stream a feature table's rows
    Features(features::FeaturesArgs),
    /// Export features from one package into a new package
    Export(export::ExportArgs),
    /// Write a small sample package for experimentation
    Demo(demo::DemoArgs),
    /// Worker child-process entry point (used by --ipc)
    #[command(hide = true)]
    Worker(worker::WorkerArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging goes to stderr: the worker subcommand owns stdout for
    // protocol frames.
    let _guard = tilepack::logging::init_console();

    let result = match cli.command {
        Command::List(args) => list::run(args, cli.ipc).await,
        Command::Tile(args) => tile::run(args, cli.ipc).await,
        Command::Features(args) => features::run(args, cli.ipc).await,
        Command::Export(args) => export::run(args, cli.ipc).await,
        Command::Demo(args) => demo::run(args),
        Command::Worker(args) => worker::run(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
