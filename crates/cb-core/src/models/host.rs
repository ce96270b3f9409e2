use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BootstrapError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ControlPlane => "control-plane",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control-plane" => Ok(Role::ControlPlane),
            "worker" => Ok(Role::Worker),
            other => Err(BootstrapError::Config(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// How to reach a host. Only a reference to the credential is kept here;
/// the key material stays in the file it points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Wrap remote commands in `sudo -n`.
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            user: None,
            port: default_ssh_port(),
            identity_file: None,
            sudo: false,
            ssh_options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: String,
    /// Node name as registered with the cluster. Falls back to the address.
    pub name: Option<String>,
    pub role: Role,
    pub connection: Connection,
    pub reachability: Reachability,
}

impl Host {
    pub fn new(address: impl Into<String>, role: Role) -> Self {
        Self {
            address: address.into(),
            name: None,
            role,
            connection: Connection::default(),
            reachability: Reachability::Unknown,
        }
    }

    /// Registry key. Records and filters refer to hosts by this id.
    pub fn id(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn node_name(&self) -> &str {
        self.id()
    }

    /// `user@address` destination for ssh/scp.
    pub fn destination(&self) -> String {
        match &self.connection.user {
            Some(user) => format!("{user}@{}", self.address),
            None => self.address.clone(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
