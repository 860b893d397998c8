use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "sandbox-ctl")]
#[command(version, about = "Run a command in a sandbox and supervise it", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(after_help = "EXAMPLES:
    # Interactive shell on a pseudo-terminal (the default)
    sandbox-ctl /bin/bash
    sandbox-ctl -u nobody /bin/sh

    # Plain pipes instead of a terminal
    sandbox-ctl --no-tty sh -c 'echo hello'

    # Without root: map container root onto the caller
    sandbox-ctl --userns --no-tty id

    # Hand the console to another process and return
    sandbox-ctl --detach --console-socket /run/console.sock /bin/sh

    sandbox-ctl check
")]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Option<Commands>,

    /// Program to run in the sandbox, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// User to run as: a name, UID, or UID:GID
    #[arg(short, long, value_name = "USER", default_value = "root", global = true)]
    pub user: String,

    /// Sandbox config file (JSON)
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Sandbox ID (random if not provided)
    #[arg(long, value_name = "ID", global = true)]
    pub id: Option<String>,

    /// Use pipes instead of a pseudo-terminal
    #[arg(long, global = true)]
    pub no_tty: bool,

    /// Share this process's stdio instead of copying through pipes
    #[arg(long, global = true)]
    pub inherit_stdio: bool,

    /// Return once started, delivering the console to --console-socket
    #[arg(long, requires = "console_socket", global = true)]
    pub detach: bool,

    /// UNIX socket that receives the console of a detached sandbox
    #[arg(long, value_name = "PATH", global = true)]
    pub console_socket: Option<PathBuf>,

    /// Do not adopt orphaned descendants
    #[arg(long, global = true)]
    pub no_subreaper: bool,

    /// Add a user namespace mapping container root to the caller
    #[arg(long, global = true)]
    pub userns: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Check sandbox requirements
    #[arg(long)]
    pub check: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program in the sandbox
    Run {
        /// Program to run, followed by its arguments
        #[arg(
            value_name = "COMMAND",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        command: Vec<String>,
    },

    /// Check sandbox requirements
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn direct_mode_keeps_hyphenated_arguments() {
        let cli = Cli::try_parse_from(["sandbox-ctl", "--no-tty", "sh", "-c", "echo hi"]).unwrap();
        assert!(cli.no_tty);
        assert!(cli.subcommand.is_none());
        assert_eq!(cli.command, vec!["sh", "-c", "echo hi"]);
        assert_eq!(cli.user, "root");
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn detach_requires_console_socket() {
        assert!(Cli::try_parse_from(["sandbox-ctl", "--detach", "sh"]).is_err());
        let cli = Cli::try_parse_from([
            "sandbox-ctl",
            "--detach",
            "--console-socket",
            "/tmp/c.sock",
            "sh",
        ])
        .unwrap();
        assert!(cli.detach);
    }

    #[test]
    fn run_subcommand_parses() {
        let cli =
            Cli::try_parse_from(["sandbox-ctl", "-u", "1000:1000", "run", "ls", "-l"]).unwrap();
        assert_eq!(cli.user, "1000:1000");
        match cli.subcommand {
            Some(Commands::Run { command }) => assert_eq!(command, vec!["ls", "-l"]),
            _ => panic!("expected run subcommand"),
        }
    }
}
