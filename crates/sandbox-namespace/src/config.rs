//! Namespace selection and ID mapping for a container

use nix::sched::CloneFlags;
use sandbox_core::{Result, SandboxError};
use serde::{Deserialize, Serialize};

/// Namespace types that can be isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Ipc,
    Net,
    Mount,
    Uts,
    User,
}

impl NamespaceType {
    pub fn all() -> [NamespaceType; 6] {
        [
            NamespaceType::Pid,
            NamespaceType::Ipc,
            NamespaceType::Net,
            NamespaceType::Mount,
            NamespaceType::Uts,
            NamespaceType::User,
        ]
    }

    /// Name of the entry under /proc/<pid>/ns
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceType::Pid => "pid",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Net => "net",
            NamespaceType::Mount => "mnt",
            NamespaceType::Uts => "uts",
            NamespaceType::User => "user",
        }
    }

    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
        }
    }
}

/// Configuration for namespace isolation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    pub mount: bool,
    pub uts: bool,
    pub user: bool,
}

impl Default for NamespaceConfig {
    /// Only a private mount namespace
    fn default() -> Self {
        Self {
            pid: false,
            ipc: false,
            net: false,
            mount: true,
            uts: false,
            user: false,
        }
    }
}

impl NamespaceConfig {
    /// All namespaces enabled
    pub fn all() -> Self {
        Self::from_types(&NamespaceType::all())
    }

    /// Share every namespace with the host
    pub fn none() -> Self {
        Self::from_types(&[])
    }

    /// User + mount namespaces, enough to launch without root
    pub fn unprivileged() -> Self {
        Self::from_types(&[NamespaceType::User, NamespaceType::Mount])
    }

    pub fn from_types(types: &[NamespaceType]) -> Self {
        let mut config = Self {
            pid: false,
            ipc: false,
            net: false,
            mount: false,
            uts: false,
            user: false,
        };
        for ty in types {
            config.set(*ty, true);
        }
        config
    }

    pub fn is_enabled(&self, ty: NamespaceType) -> bool {
        match ty {
            NamespaceType::Pid => self.pid,
            NamespaceType::Ipc => self.ipc,
            NamespaceType::Net => self.net,
            NamespaceType::Mount => self.mount,
            NamespaceType::Uts => self.uts,
            NamespaceType::User => self.user,
        }
    }

    pub fn set(&mut self, ty: NamespaceType, enabled: bool) {
        let slot = match ty {
            NamespaceType::Pid => &mut self.pid,
            NamespaceType::Ipc => &mut self.ipc,
            NamespaceType::Net => &mut self.net,
            NamespaceType::Mount => &mut self.mount,
            NamespaceType::Uts => &mut self.uts,
            NamespaceType::User => &mut self.user,
        };
        *slot = enabled;
    }

    /// Enabled namespaces, in clone order
    pub fn enabled(&self) -> Vec<NamespaceType> {
        NamespaceType::all()
            .into_iter()
            .filter(|ty| self.is_enabled(*ty))
            .collect()
    }

    /// Convert to clone flags
    pub fn to_clone_flags(&self) -> CloneFlags {
        self.enabled()
            .iter()
            .fold(CloneFlags::empty(), |flags, ty| flags | ty.clone_flag())
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().len()
    }
}

/// One line of a uid_map or gid_map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Translate a container id into the host id it maps to
    pub fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

/// The part of a container's configuration the supervisor needs to know about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerConfig {
    pub namespaces: NamespaceConfig,
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
}

impl ContainerConfig {
    pub fn new(namespaces: NamespaceConfig) -> Self {
        Self {
            namespaces,
            ..Default::default()
        }
    }

    /// Map container root onto the given host ids, one id each
    pub fn with_root_mapping(mut self, host_uid: u32, host_gid: u32) -> Self {
        self.uid_mappings = vec![IdMap::new(0, host_uid, 1)];
        self.gid_mappings = vec![IdMap::new(0, host_gid, 1)];
        self
    }

    /// Host uid that container uid 0 maps to
    pub fn host_root_uid(&self) -> Result<u32> {
        self.host_uid(0)
    }

    /// Host gid that container gid 0 maps to
    pub fn host_root_gid(&self) -> Result<u32> {
        self.host_gid(0)
    }

    pub fn host_uid(&self, container_id: u32) -> Result<u32> {
        self.translate(&self.uid_mappings, container_id, "uid")
    }

    pub fn host_gid(&self, container_id: u32) -> Result<u32> {
        self.translate(&self.gid_mappings, container_id, "gid")
    }

    /// Reject user namespaces without a usable root mapping
    pub fn validate(&self) -> Result<()> {
        if self.namespaces.user {
            self.host_root_uid()?;
            self.host_root_gid()?;
        } else if !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "id mappings require a user namespace".to_string(),
            ));
        }
        Ok(())
    }

    fn translate(&self, mappings: &[IdMap], container_id: u32, kind: &str) -> Result<u32> {
        if !self.namespaces.user {
            return Ok(container_id);
        }
        mappings
            .iter()
            .find_map(|m| m.to_host(container_id))
            .ok_or_else(|| {
                SandboxError::Namespace(format!(
                    "user namespace enabled, but no {} mapping for {}",
                    kind, container_id
                ))
            })
    }
}
