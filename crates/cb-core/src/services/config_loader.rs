use std::path::Path;

use serde::Deserialize;

use crate::error::{BootstrapError, Result};
use crate::models::{ClusterConfig, Connection, Host, Reachability, Role, Step};

pub const DEFAULT_INVENTORY_FILENAME: &str = "inventory.yaml";

/// Parsed inventory: cluster settings plus hosts in declaration order.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub cluster: ClusterConfig,
    pub hosts: Vec<Host>,
}

#[derive(Deserialize)]
struct RawInventory {
    #[serde(default)]
    cluster: ClusterConfig,
    /// Applied to every host before its own connection fields.
    #[serde(default)]
    defaults: Option<Connection>,
    hosts: serde_yaml::Mapping,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HostEntry {
    Address(String),
    Detailed(RawHost),
}

#[derive(Deserialize)]
struct RawHost {
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    identity_file: Option<std::path::PathBuf>,
    #[serde(default)]
    sudo: Option<bool>,
    #[serde(default)]
    ssh_options: Vec<String>,
}

pub fn load(path: &Path) -> Result<Inventory> {
    if !path.exists() {
        return Err(BootstrapError::InventoryNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<Inventory> {
    let raw: RawInventory =
        serde_yaml::from_str(contents).map_err(|e| BootstrapError::Config(e.to_string()))?;
    let defaults = raw.defaults.unwrap_or_default();

    let mut hosts = Vec::new();
    for (key, value) in raw.hosts {
        let role_name = key
            .as_str()
            .ok_or_else(|| BootstrapError::Config("role names must be strings".into()))?;
        let role: Role = role_name.parse()?;

        let entries: Vec<HostEntry> = match value {
            serde_yaml::Value::Sequence(_) => serde_yaml::from_value(value),
            other => serde_yaml::from_value(other).map(|entry| vec![entry]),
        }
        .map_err(|e| BootstrapError::Config(format!("hosts.{role_name}: {e}")))?;

        for entry in entries {
            hosts.push(build_host(entry, role, &defaults)?);
        }
    }

    Ok(Inventory {
        cluster: raw.cluster,
        hosts,
    })
}

fn build_host(entry: HostEntry, role: Role, defaults: &Connection) -> Result<Host> {
    let raw = match entry {
        HostEntry::Address(address) => RawHost {
            address,
            name: None,
            user: None,
            port: None,
            identity_file: None,
            sudo: None,
            ssh_options: Vec::new(),
        },
        HostEntry::Detailed(raw) => raw,
    };
    if raw.address.trim().is_empty() {
        return Err(BootstrapError::Config(format!(
            "{role} host with an empty address"
        )));
    }

    let mut ssh_options = defaults.ssh_options.clone();
    ssh_options.extend(raw.ssh_options);
    Ok(Host {
        address: raw.address.trim().to_string(),
        name: raw.name,
        role,
        connection: Connection {
            user: raw.user.or_else(|| defaults.user.clone()),
            port: raw.port.unwrap_or(defaults.port),
            identity_file: raw.identity_file.or_else(|| defaults.identity_file.clone()),
            sudo: raw.sudo.unwrap_or(defaults.sudo),
            ssh_options,
        },
        reachability: Reachability::Unknown,
    })
}

#[derive(Deserialize)]
struct RawSteps {
    steps: Vec<Step>,
}

/// Load a custom step catalog from YAML (`steps: [...]`).
pub fn load_steps(path: &Path) -> Result<Vec<Step>> {
    if !path.exists() {
        return Err(BootstrapError::Config(format!(
            "step file not found at {}",
            path.display()
        )));
    }
    let contents = std::fs::read_to_string(path)?;
    let raw: RawSteps =
        serde_yaml::from_str(&contents).map_err(|e| BootstrapError::Config(e.to_string()))?;
    Ok(raw.steps)
}
