//! Private endpoint allocation.
//!
//! Each endpoint an addon declares gets a loopback address from the gear's
//! private block and a port. Results are stored in the gear environment
//! under the endpoint's names so later runs reuse them.

use super::registry::AddonRegistry;
use super::{Addon, Endpoint};
use crate::config::types::{GearError, Result};
use crate::gear::{environ, Gear, MAX_HOST_ID};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

/// Whether something already listens on an address
pub trait AddressProbe {
    fn is_bound(&self, ip: Ipv4Addr, port: u16) -> bool;
}

/// Probe by attempting a TCP connection
pub struct TcpProbe {
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
        }
    }
}

impl AddressProbe for TcpProbe {
    fn is_bound(&self, ip: Ipv4Addr, port: u16) -> bool {
        TcpStream::connect_timeout(&SocketAddr::from((ip, port)), self.timeout).is_ok()
    }
}

/// Concrete address assigned to a declared endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: Endpoint,
    pub ip: Ipv4Addr,
    pub port: u16,
}

pub struct EndpointAllocator<'a> {
    gear: &'a Gear,
    probe: &'a dyn AddressProbe,
}

impl<'a> EndpointAllocator<'a> {
    pub fn new(gear: &'a Gear, probe: &'a dyn AddressProbe) -> Self {
        Self { gear, probe }
    }

    /// Assign addresses to every endpoint of `addon`.
    ///
    /// Addresses already recorded under an endpoint's ip name are reused.
    /// New ones skip every address held by a valid addon's endpoint. All
    /// resolved pairs are then probed and every conflict is reported at once;
    /// variables already written are left in place.
    pub fn allocate(&self, addon: &Addon, registry: &AddonRegistry) -> Result<Vec<ResolvedEndpoint>> {
        if addon.endpoints.is_empty() {
            return Ok(Vec::new());
        }

        let mut env = environ::load_all(self.gear)?;
        let env_dir = self.gear.env_dir();

        let mut allocated: HashSet<Ipv4Addr> = registry
            .valid()
            .flat_map(|a| a.endpoints.iter())
            .filter_map(|ep| env.get(&ep.private_ip_name))
            .filter_map(|ip| ip.parse().ok())
            .collect();

        let mut resolved = Vec::with_capacity(addon.endpoints.len());
        for endpoint in &addon.endpoints {
            let ip = match env.get(&endpoint.private_ip_name).and_then(|ip| ip.parse().ok()) {
                Some(ip) => ip,
                None => {
                    let ip = self.next_free_ip(&allocated).ok_or_else(|| {
                        GearError::ResourceExhausted(format!(
                            "No IP was available for endpoint {}({})",
                            endpoint.private_ip_name, endpoint.private_port_name
                        ))
                    })??;
                    environ::add(&env_dir, &endpoint.private_ip_name, &ip.to_string(), false)?;
                    env.insert(endpoint.private_ip_name.clone(), ip.to_string());
                    ip
                }
            };
            allocated.insert(ip);

            let port = match env.get(&endpoint.private_port_name).and_then(|p| p.parse().ok()) {
                Some(port) => port,
                None => {
                    let port = endpoint.private_port;
                    environ::add(&env_dir, &endpoint.private_port_name, &port.to_string(), false)?;
                    env.insert(endpoint.private_port_name.clone(), port.to_string());
                    port
                }
            };

            resolved.push(ResolvedEndpoint {
                endpoint: endpoint.clone(),
                ip,
                port,
            });
        }

        let conflicts: Vec<String> = resolved
            .iter()
            .filter(|r| self.probe.is_bound(r.ip, r.port))
            .map(|r| {
                format!(
                    "{}({})={}({})",
                    r.endpoint.private_ip_name, r.endpoint.private_port_name, r.ip, r.port
                )
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(GearError::Conflict(format!(
                "Failed to create the following endpoints: {}",
                conflicts.join(", ")
            )));
        }

        for r in &resolved {
            log::debug!(
                "Endpoint {}({}) of {} bound to {}:{}",
                r.endpoint.private_ip_name,
                r.endpoint.private_port_name,
                addon.name,
                r.ip,
                r.port
            );
        }
        Ok(resolved)
    }

    fn next_free_ip(&self, allocated: &HashSet<Ipv4Addr>) -> Option<Result<Ipv4Addr>> {
        for host_id in 1..=MAX_HOST_ID {
            match self.gear.ip_address(host_id) {
                Ok(ip) if !allocated.contains(&ip) => return Some(Ok(ip)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    /// Drop the recorded addresses of `addon`'s endpoints; never fails
    pub fn deallocate(&self, addon: &Addon) {
        let env_dir = self.gear.env_dir();
        for endpoint in &addon.endpoints {
            for key in [&endpoint.private_ip_name, &endpoint.private_port_name] {
                if let Err(e) = environ::remove(&env_dir, key) {
                    log::warn!("Failed to remove {} of {}: {}", key, addon.name, e);
                }
            }
        }
    }
}
