//! Sandbox controller CLI - run a command in a namespace sandbox and
//! supervise it until it exits

mod cli;
mod commands;
mod config;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::check_requirements;
use console::style;
use runner::{run_sandbox, RunConfig};

fn main() {
    let mut cli = Cli::parse();

    logging::init_logger(cli.verbose);

    if cli.check {
        check_requirements();
        return;
    }

    let command = match cli.subcommand.take() {
        Some(Commands::Check) => {
            check_requirements();
            return;
        }
        Some(Commands::Run { command }) => command,
        None => std::mem::take(&mut cli.command),
    };

    if command.is_empty() {
        eprintln!("{} No program specified", style("error:").red().bold());
        eprintln!(
            "Try {} for more information",
            style("sandbox-ctl --help").cyan()
        );
        std::process::exit(1);
    }

    match run_sandbox(run_config(cli, command)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn run_config(cli: Cli, command: Vec<String>) -> RunConfig {
    RunConfig {
        id: cli.id,
        command,
        user: cli.user,
        config: cli.config,
        no_tty: cli.no_tty,
        inherit_stdio: cli.inherit_stdio,
        detach: cli.detach,
        console_socket: cli.console_socket,
        no_subreaper: cli.no_subreaper,
        userns: cli.userns,
        verbose: cli.verbose,
    }
}
