//! Graft - tweak injection manager
//!
//! Injects dynamic libraries, frameworks and resource bundles into installed
//! applications by adding load commands to their executables, and keeps
//! enough state to take every change back out again.

use clap::Parser;

mod cli;
mod commands;
mod config;
mod coordinator;
mod directory;
mod error;
mod hash;
mod inspector;
mod patcher;
mod reloader;
mod signer;
mod store;
mod ui;

#[cfg(test)]
mod test_fixtures;

use cli::{Cli, Commands};

/// `RUST_LOG` wins over `-v` flags when set
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let global = cli.global;
    let result = match cli.command {
        Commands::List(args) => commands::list::run(&global, args),
        Commands::View(args) => commands::view::run(&global, args),
        Commands::Inject(args) => commands::inject::run(&global, args),
        Commands::Eject(args) => commands::eject::run(&global, args),
        Commands::Disable(args) => commands::disable::run(&global, args),
        Commands::Enable(args) => commands::enable::run(&global, args),
        Commands::Verify(args) => commands::verify::run(&global, args),
        Commands::Recover => commands::recover::run(&global),
        Commands::Completions(args) => commands::completions::run(args),
        Commands::Version => commands::version::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}
