use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{BootstrapError, Result};
use crate::models::{Host, Reachability, Role};

use super::config_loader;
use super::remote::RemoteChannel;

/// The validated set of target machines for one run.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    hosts: Vec<Host>,
}

impl HostRegistry {
    /// Validate identifiers and role cardinality. Exactly one control-plane
    /// host is allowed; any number of workers.
    pub fn new(hosts: Vec<Host>) -> Result<Self> {
        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.id().to_string()) {
                return Err(BootstrapError::Config(format!(
                    "duplicate host identifier '{}'",
                    host.id()
                )));
            }
            if host.name.is_some() && !seen.insert(host.address.clone()) {
                return Err(BootstrapError::Config(format!(
                    "duplicate host address '{}'",
                    host.address
                )));
            }
        }

        let control_planes = hosts
            .iter()
            .filter(|h| h.role == Role::ControlPlane)
            .count();
        if control_planes != 1 {
            return Err(BootstrapError::Topology(format!(
                "expected exactly one control-plane host, found {control_planes}"
            )));
        }

        Ok(Self { hosts })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let inventory = config_loader::load(path)?;
        Self::new(inventory.hosts)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Hosts with the given role, in declaration order.
    pub fn filter(&self, role: Role) -> Vec<Host> {
        self.hosts.iter().filter(|h| h.role == role).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id() == id || h.address == id)
    }

    pub fn control_plane(&self) -> &Host {
        // `new` guarantees exactly one
        self.hosts
            .iter()
            .find(|h| h.role == Role::ControlPlane)
            .unwrap_or(&self.hosts[0])
    }

    /// Hosts selected by id or address, in declaration order. An empty filter
    /// selects every host.
    pub fn select(&self, filter: &[String]) -> Result<Vec<Host>> {
        if filter.is_empty() {
            return Ok(self.hosts.clone());
        }
        for id in filter {
            if self.get(id).is_none() {
                return Err(BootstrapError::Config(format!(
                    "host filter names unknown host '{id}'"
                )));
            }
        }
        Ok(self
            .hosts
            .iter()
            .filter(|h| filter.iter().any(|id| h.id() == id || &h.address == id))
            .cloned()
            .collect())
    }

    /// Refresh reachability by connecting to each host's ssh port.
    pub async fn probe_all(&mut self, channel: &dyn RemoteChannel, timeout: Duration) {
        for host in &mut self.hosts {
            let reachable = channel
                .probe(&host.address, host.connection.port, timeout)
                .await;
            host.reachability = if reachable {
                Reachability::Reachable
            } else {
                Reachability::Unreachable
            };
            tracing::debug!(host = %host.id(), reachability = ?host.reachability, "reachability_probed");
        }
    }
}
