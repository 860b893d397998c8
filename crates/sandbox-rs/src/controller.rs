//! Main sandbox controller: configuration, builder and a single launch

use std::path::{Path, PathBuf};

use log::info;
use sandbox_console::HostStreams;
use sandbox_core::capabilities::SystemCapabilities;
use sandbox_core::{Result, SandboxError};
use sandbox_namespace::{ContainerConfig, IdMap, NamespaceConfig};
use uuid::Uuid;

use crate::container::{Container, NamespaceContainer};
use crate::execution::{
    ConsoleSize, ExecutionOrchestrator, LinuxCapabilities, ProcessSpec, RunOptions, RunOutcome,
};

/// Everything needed to launch one sandboxed process
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Unique sandbox ID
    pub id: String,
    pub process: ProcessSpec,
    pub container: ContainerConfig,
    pub options: RunOptions,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            process: ProcessSpec::default(),
            container: ContainerConfig::default(),
            options: RunOptions::default(),
        }
    }
}

impl SandboxConfig {
    /// Validate configuration and check the host can run it
    pub fn validate(&self) -> Result<()> {
        self.validate_invariants()?;

        let caps = SystemCapabilities::detect();
        if !caps.has_root && !self.container.namespaces.user {
            return Err(SandboxError::PermissionDenied(
                "running without root requires a user namespace".to_string(),
            ));
        }
        if self.container.namespaces.user && !caps.has_user_namespaces {
            return Err(SandboxError::FeatureNotAvailable(
                "user namespaces are not available on this host".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_invariants(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "Sandbox ID cannot be empty".to_string(),
            ));
        }

        if self.process.args.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "a command to run is required".to_string(),
            ));
        }
        self.process.validate()?;
        self.container.validate()?;

        if self.options.detach {
            if self.options.console_socket.is_none() {
                return Err(SandboxError::InvalidConfig(
                    "detach requires a console socket path".to_string(),
                ));
            }
            if !self.process.terminal {
                return Err(SandboxError::InvalidConfig(
                    "detach requires a terminal".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Builder pattern for sandbox creation
#[derive(Default)]
pub struct SandboxBuilder {
    config: SandboxConfig,
}

impl SandboxBuilder {
    /// Create new builder
    pub fn new(id: &str) -> Self {
        Self {
            config: SandboxConfig {
                id: id.to_string(),
                ..Default::default()
            },
        }
    }

    /// Start from a complete configuration, e.g. one loaded from a file
    pub fn from_config(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Set the program and its arguments
    pub fn command(mut self, program: &str, args: &[&str]) -> Self {
        self.config.process.args = std::iter::once(program)
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect();
        self
    }

    /// Set or replace one environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.config.process.set_env(key, value);
        self
    }

    /// Set working directory
    pub fn cwd(mut self, path: impl AsRef<Path>) -> Self {
        self.config.process.cwd = path.as_ref().to_string_lossy().into_owned();
        self
    }

    /// Set the container uid and gid the process runs as
    pub fn user(mut self, uid: u32, gid: u32) -> Self {
        self.config.process.user.uid = uid;
        self.config.process.user.gid = gid;
        self
    }

    pub fn additional_gids(mut self, gids: &[u32]) -> Self {
        self.config.process.user.additional_gids = gids.to_vec();
        self
    }

    /// Allocate a pseudo-terminal for the process
    pub fn terminal(mut self, enabled: bool) -> Self {
        self.config.process.terminal = enabled;
        self
    }

    pub fn console_size(mut self, height: u16, width: u16) -> Self {
        self.config.process.console_size = Some(ConsoleSize { height, width });
        self
    }

    /// Grant the same capabilities in every set
    pub fn capabilities(mut self, names: &[&str]) -> Self {
        self.config.process.capabilities = Some(LinuxCapabilities::uniform(names));
        self
    }

    pub fn no_new_privileges(mut self, enabled: bool) -> Self {
        self.config.process.no_new_privileges = enabled;
        self
    }

    pub fn apparmor_profile(mut self, profile: &str) -> Self {
        self.config.process.apparmor_profile = Some(profile.to_string());
        self
    }

    pub fn selinux_label(mut self, label: &str) -> Self {
        self.config.process.selinux_label = Some(label.to_string());
        self
    }

    /// Set namespace configuration
    pub fn namespaces(mut self, config: NamespaceConfig) -> Self {
        self.config.container.namespaces = config;
        self
    }

    /// Map container root to the given host ids
    pub fn root_mapping(mut self, host_uid: u32, host_gid: u32) -> Self {
        self.config.container.uid_mappings = vec![IdMap::new(0, host_uid, 1)];
        self.config.container.gid_mappings = vec![IdMap::new(0, host_gid, 1)];
        self
    }

    pub fn uid_mapping(mut self, map: IdMap) -> Self {
        self.config.container.uid_mappings.push(map);
        self
    }

    pub fn gid_mapping(mut self, map: IdMap) -> Self {
        self.config.container.gid_mappings.push(map);
        self
    }

    /// Hand the console to a listener on `socket` and return once started
    pub fn detach(mut self, socket: impl AsRef<Path>) -> Self {
        self.config.options.detach = true;
        self.config.options.console_socket = Some(socket.as_ref().to_path_buf());
        self
    }

    pub fn console_socket(mut self, socket: impl AsRef<Path>) -> Self {
        self.config.options.console_socket = Some(socket.as_ref().to_path_buf());
        self
    }

    pub fn inherit_stdio(mut self, enabled: bool) -> Self {
        self.config.options.inherit_stdio = enabled;
        self
    }

    pub fn subreaper(mut self, enabled: bool) -> Self {
        self.config.options.subreaper = enabled;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.options.log_level = Some(level.to_string());
        self
    }

    /// Build sandbox
    pub fn build(self) -> Result<Sandbox> {
        self.config.validate()?;
        Sandbox::new(self.config)
    }
}

/// A configured sandbox; runs its process at most once
pub struct Sandbox {
    config: SandboxConfig,
    container: NamespaceContainer,
    outcome: Option<RunOutcome>,
}

impl Sandbox {
    fn new(config: SandboxConfig) -> Result<Self> {
        let container = NamespaceContainer::create(&config.id, config.container.clone())?;
        Ok(Self {
            config,
            container,
            outcome: None,
        })
    }

    /// Get sandbox ID
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Console socket a detached launch delivers its console to
    pub fn console_socket(&self) -> Option<&PathBuf> {
        self.config.options.console_socket.as_ref()
    }

    /// Check if the sandbox has a live detached process
    pub fn is_running(&self) -> bool {
        matches!(self.outcome, Some(RunOutcome::Detached)) && self.container.init_pid().is_some()
    }

    /// Run the configured process and supervise it until it exits
    pub fn run(&mut self) -> Result<RunOutcome> {
        self.launch(None)
    }

    /// Like [`Sandbox::run`], with pipe-mode output going to `streams`
    pub fn run_with_streams(&mut self, streams: HostStreams) -> Result<RunOutcome> {
        self.launch(Some(streams))
    }

    fn launch(&mut self, streams: Option<HostStreams>) -> Result<RunOutcome> {
        if self.outcome.is_some() {
            return Err(SandboxError::AlreadyRunning);
        }

        info!(
            "sandbox {}: running {:?}",
            self.config.id, self.config.process.args
        );

        let mut orchestrator = ExecutionOrchestrator::new(self.config.options.clone());
        if let Some(streams) = streams {
            orchestrator = orchestrator.with_host_streams(streams);
        }

        let outcome = orchestrator.run(&self.config.process, &mut self.container)?;
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Kill whatever a detached launch left running
    pub fn kill(&mut self) -> Result<()> {
        if self.container.init_pid().is_none() {
            return Err(SandboxError::NotRunning);
        }
        self.container.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn config_with_command(id: &str) -> SandboxConfig {
        let mut config = SandboxConfig {
            id: id.to_string(),
            ..Default::default()
        };
        config.process.args = vec!["/bin/true".to_string()];
        config
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert!(Uuid::parse_str(&config.id).is_ok());
        assert!(config.process.terminal);
        assert_eq!(config.container.namespaces, NamespaceConfig::default());
        assert!(config.options.subreaper);
    }

    #[test]
    fn default_ids_are_unique() {
        assert_ne!(SandboxConfig::default().id, SandboxConfig::default().id);
    }

    #[test]
    fn test_sandbox_config_validate_empty_id() {
        let mut config = config_with_command("x");
        config.id = String::new();
        assert!(config.validate_invariants().is_err());
    }

    #[test]
    fn test_sandbox_config_validate_requires_command() {
        let config = SandboxConfig {
            id: "no-cmd".to_string(),
            ..Default::default()
        };
        let err = config.validate_invariants().unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn detach_requires_socket_and_terminal() {
        let mut config = config_with_command("detach");
        config.options.detach = true;
        assert!(config.validate_invariants().is_err());

        config.options.console_socket = Some(PathBuf::from("/tmp/console.sock"));
        assert!(config.validate_invariants().is_ok());

        config.process.terminal = false;
        assert!(config.validate_invariants().is_err());
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let mut config = config_with_command("caps");
        config.process.capabilities = Some(LinuxCapabilities::uniform(&["CAP_TELEPORT"]));
        assert!(config.validate_invariants().is_err());
    }

    #[test]
    fn user_namespace_needs_root_mapping() {
        let mut config = config_with_command("userns");
        config.container.namespaces = NamespaceConfig::unprivileged();
        assert!(config.validate_invariants().is_err());

        config.container = config.container.with_root_mapping(1000, 1000);
        assert!(config.validate_invariants().is_ok());
    }

    #[test]
    fn test_sandbox_builder_new() {
        let builder = SandboxBuilder::new("test");
        assert_eq!(builder.config.id, "test");
    }

    #[test]
    fn test_sandbox_builder_command_and_env() {
        let builder = SandboxBuilder::new("test")
            .command("sh", &["-c", "echo hi"])
            .env("LANG", "C")
            .cwd("/")
            .user(1000, 1000)
            .additional_gids(&[27]);
        let process = &builder.config.process;
        assert_eq!(process.args, vec!["sh", "-c", "echo hi"]);
        assert!(process.env.contains(&"LANG=C".to_string()));
        assert_eq!(process.cwd, "/");
        assert_eq!(process.user.uid, 1000);
        assert_eq!(process.user.additional_gids, vec![27]);
    }

    #[test]
    fn test_sandbox_builder_console_options() {
        let builder = SandboxBuilder::new("test")
            .terminal(true)
            .console_size(40, 120)
            .detach("/run/console.sock");
        assert_eq!(
            builder.config.process.console_size,
            Some(ConsoleSize {
                height: 40,
                width: 120
            })
        );
        assert!(builder.config.options.detach);
        assert_eq!(
            builder.config.options.console_socket,
            Some(PathBuf::from("/run/console.sock"))
        );
    }

    #[test]
    fn test_sandbox_builder_security_options() {
        let builder = SandboxBuilder::new("test")
            .capabilities(&["CAP_NET_BIND_SERVICE"])
            .no_new_privileges(true)
            .apparmor_profile("sandbox")
            .selinux_label("system_u:system_r:container_t:s0");
        let process = &builder.config.process;
        let caps = process.capabilities.as_ref().unwrap();
        assert_eq!(caps.ambient, vec!["CAP_NET_BIND_SERVICE".to_string()]);
        assert!(process.no_new_privileges);
        assert_eq!(process.apparmor_profile.as_deref(), Some("sandbox"));
        assert!(process.selinux_label.is_some());
    }

    #[test]
    fn test_sandbox_builder_mappings() {
        let builder = SandboxBuilder::new("test")
            .namespaces(NamespaceConfig::unprivileged())
            .root_mapping(1000, 100)
            .uid_mapping(IdMap::new(1, 100000, 65536));
        let container = &builder.config.container;
        assert_eq!(container.host_root_uid().unwrap(), 1000);
        assert_eq!(container.host_root_gid().unwrap(), 100);
        assert_eq!(container.host_uid(5).unwrap(), 100004);
    }

    #[test]
    fn test_sandbox_builder_build_validates_config() {
        let result = SandboxBuilder::new("").command("/bin/true", &[]).build();
        assert!(result.is_err());
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sandbox_runs_command_once() {
        if !sandbox_core::util::is_root() {
            eprintln!("SKIP: launching without a user namespace requires root");
            return;
        }
        let _guard = serial_guard();

        let output = SharedBuffer::default();
        let mut sandbox = SandboxBuilder::new("run-once")
            .command("/bin/sh", &["-c", "echo sandboxed; exit 4"])
            .namespaces(NamespaceConfig::none())
            .terminal(false)
            .subreaper(false)
            .build()
            .unwrap();

        let outcome = sandbox
            .run_with_streams(HostStreams {
                input: Box::new(io::empty()),
                output: Box::new(output.clone()),
                error: Box::new(io::sink()),
            })
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited(4));
        assert!(String::from_utf8_lossy(&output.0.lock().unwrap()).contains("sandboxed"));
        assert!(!sandbox.is_running());

        assert!(matches!(sandbox.run(), Err(SandboxError::AlreadyRunning)));
        assert!(matches!(sandbox.kill(), Err(SandboxError::NotRunning)));
    }
}
