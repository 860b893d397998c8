use console::style;
use log::{debug, info, warn};
use sandbox_rs::{
    util, NamespaceConfig, RunOutcome, SandboxBuilder, SandboxConfig, SandboxError,
};
use std::path::PathBuf;

use crate::config::FileConfig;

/// Exit status reported when the launch was interrupted by the user
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Configuration for sandbox execution
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub id: Option<String>,
    pub command: Vec<String>,
    pub user: String,
    pub config: PathBuf,
    pub no_tty: bool,
    pub inherit_stdio: bool,
    pub detach: bool,
    pub console_socket: Option<PathBuf>,
    pub no_subreaper: bool,
    pub userns: bool,
    pub verbose: bool,
}

/// Merge the config file and the command line into one sandbox configuration.
/// Flags win over the file.
pub fn build_config(run: &RunConfig) -> Result<SandboxConfig, Box<dyn std::error::Error>> {
    let mut config = SandboxConfig::default();
    if let Some(id) = &run.id {
        config.id = id.clone();
    }

    FileConfig::load(&run.config)?.apply(&mut config);

    config.process.args = run.command.clone();

    let identity = util::lookup_user(&run.user)?;
    debug!(
        "running as {} (uid={}, gid={})",
        identity.name, identity.uid, identity.gid
    );
    config.process.user.uid = identity.uid;
    config.process.user.gid = identity.gid;

    if run.no_tty {
        config.process.terminal = false;
    }

    if run.userns {
        let namespaces = &mut config.container.namespaces;
        if *namespaces == NamespaceConfig::default() {
            *namespaces = NamespaceConfig::unprivileged();
        }
        namespaces.user = true;
        if config.container.uid_mappings.is_empty() && config.container.gid_mappings.is_empty() {
            config.container = config
                .container
                .with_root_mapping(util::get_uid(), util::get_gid());
        }
    }

    let options = &mut config.options;
    options.inherit_stdio = run.inherit_stdio;
    options.detach = run.detach;
    options.console_socket = run.console_socket.clone();
    options.subreaper = !run.no_subreaper;
    options.log_level = Some(if run.verbose { "debug" } else { "warn" }.to_string());

    Ok(config)
}

/// Launch the sandbox and return the status this process should exit with
pub fn run_sandbox(run: RunConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let config = build_config(&run)?;
    let sandbox_id = config.id.clone();

    info!("Building sandbox '{}'", sandbox_id);
    let mut sandbox = SandboxBuilder::from_config(config).build()?;

    info!("Executing: {:?}", run.command);
    let outcome = match sandbox.run() {
        Ok(outcome) => outcome,
        Err(SandboxError::Interrupted) => {
            warn!("sandbox {} interrupted", sandbox_id);
            return Ok(INTERRUPTED_EXIT_CODE);
        }
        Err(e) => return Err(e.into()),
    };

    match outcome {
        RunOutcome::Exited(code) => {
            debug!("sandbox {} exited with {}", sandbox_id, code);
            Ok(code)
        }
        RunOutcome::Detached => {
            let socket = sandbox
                .console_socket()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            eprintln!(
                "{} {} {} {}",
                style("detached").green().bold(),
                style(&sandbox_id).bold(),
                style("console sent to").dim(),
                socket
            );
            Ok(0)
        }
    }
}
