//! Optional JSON file with process and namespace settings

use log::debug;
use sandbox_rs::execution::ConsoleSize;
use sandbox_rs::{IdMap, LinuxCapabilities, NamespaceConfig, NamespaceType, SandboxConfig};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "./config";

/// Settings read from `--config`; anything left out keeps its default
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub capabilities: Option<LinuxCapabilities>,
    pub namespaces: Option<Vec<NamespaceType>>,
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
    pub env: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub terminal: Option<bool>,
    pub no_new_privileges: Option<bool>,
    pub console_size: Option<ConsoleSize>,
    pub apparmor_profile: Option<String>,
    pub selinux_label: Option<String>,
}

impl FileConfig {
    /// Read `path`. A missing file is only an error when the path was chosen
    /// explicitly rather than left at [`DEFAULT_CONFIG_PATH`].
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound && path == Path::new(DEFAULT_CONFIG_PATH) => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(format!("reading config {}: {}", path.display(), e).into()),
        };
        Self::parse(&contents).map_err(|e| format!("parsing config {}: {}", path.display(), e).into())
    }

    pub fn parse(contents: &str) -> serde_json::Result<Self> {
        serde_json::from_str(contents)
    }

    /// Overlay the file's settings onto `config`
    pub fn apply(self, config: &mut SandboxConfig) {
        let process = &mut config.process;
        if let Some(capabilities) = self.capabilities {
            process.capabilities = Some(capabilities);
        }
        if let Some(env) = self.env {
            process.env = env;
        }
        if let Some(cwd) = self.cwd {
            process.cwd = cwd;
        }
        if let Some(terminal) = self.terminal {
            process.terminal = terminal;
        }
        if let Some(no_new_privileges) = self.no_new_privileges {
            process.no_new_privileges = no_new_privileges;
        }
        if self.console_size.is_some() {
            process.console_size = self.console_size;
        }
        if self.apparmor_profile.is_some() {
            process.apparmor_profile = self.apparmor_profile;
        }
        if self.selinux_label.is_some() {
            process.selinux_label = self.selinux_label;
        }

        if let Some(namespaces) = self.namespaces {
            config.container.namespaces = NamespaceConfig::from_types(&namespaces);
        }
        if !self.uid_mappings.is_empty() {
            config.container.uid_mappings = self.uid_mappings;
        }
        if !self.gid_mappings.is_empty() {
            config.container.gid_mappings = self.gid_mappings;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_changes_nothing() {
        let mut config = SandboxConfig::default();
        let before = config.process.clone();
        FileConfig::parse("{}").unwrap().apply(&mut config);
        assert_eq!(config.process, before);
        assert_eq!(config.container.namespaces, NamespaceConfig::default());
    }

    #[test]
    fn settings_overlay_defaults() {
        let file = FileConfig::parse(
            r#"{
                "capabilities": {
                    "bounding": ["CAP_NET_BIND_SERVICE"],
                    "effective": ["CAP_NET_BIND_SERVICE"]
                },
                "namespaces": ["mount", "pid", "uts"],
                "env": ["PATH=/bin", "HOME=/root"],
                "cwd": "/",
                "terminal": false,
                "noNewPrivileges": true,
                "consoleSize": {"height": 50, "width": 132}
            }"#,
        )
        .unwrap();

        let mut config = SandboxConfig::default();
        file.apply(&mut config);

        let process = &config.process;
        assert_eq!(process.env, vec!["PATH=/bin", "HOME=/root"]);
        assert_eq!(process.cwd, "/");
        assert!(!process.terminal);
        assert!(process.no_new_privileges);
        assert_eq!(process.console_size.unwrap().width, 132);
        let caps = process.capabilities.as_ref().unwrap();
        assert_eq!(caps.bounding, vec!["CAP_NET_BIND_SERVICE"]);
        assert!(caps.ambient.is_empty());

        let namespaces = &config.container.namespaces;
        assert!(namespaces.mount && namespaces.pid && namespaces.uts);
        assert!(!namespaces.net && !namespaces.user);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(FileConfig::parse(r#"{"readonlyPath": []}"#).is_err());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cwd": "/srv"}}"#).unwrap();
        let loaded = FileConfig::load(file.path()).unwrap();
        assert_eq!(loaded.cwd.as_deref(), Some("/srv"));
    }
}
