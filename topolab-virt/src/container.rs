//! Container engine driver.
//!
//! Drives the `docker` CLI (locally or against `ssh://<host>`) and the
//! `ip` tool for link discovery. Containers map onto the driver contract
//! as domains; container networks are always "active" once they exist and
//! volumes are not supported.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::traits::{Driver, DriverCapabilities};
use crate::types::*;

/// Container driver shelling out to the docker CLI.
pub struct ContainerDriver {
    name: String,
    host: Option<String>,
}

impl ContainerDriver {
    /// Driver for the local engine, or a remote one reached over ssh.
    pub fn new(name: impl Into<String>, host: Option<String>) -> Self {
        Self {
            name: name.into(),
            host,
        }
    }

    /// Check that the docker CLI can reach the engine.
    pub async fn connect(&self) -> Result<()> {
        self.docker(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| DriverError::ConnectionFailed(format!("{}: {}", self.name, e)))?;
        info!(hypervisor = %self.name, "Connected to container engine");
        Ok(())
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.host {
            cmd.arg("-H").arg(format!("ssh://{}", host));
        }
        cmd.args(args);
        run(cmd, "docker").await
    }

    /// Run `ip` in the host namespace of the engine.
    async fn host_ip(&self, args: &[&str]) -> Result<String> {
        let cmd = match &self.host {
            Some(host) => {
                let mut cmd = Command::new("ssh");
                cmd.arg(host).arg("ip").args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new("ip");
                cmd.args(args);
                cmd
            }
        };
        run(cmd, "ip").await
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^{}$", name);
        let out = self
            .docker(&["network", "ls", "--filter", &filter, "--format", "{{.Name}}"])
            .await?;
        Ok(out.lines().any(|l| l.trim() == name))
    }

    async fn ensure_network(&self, name: &str, subnet: Option<&str>) -> Result<()> {
        if self.network_exists(name).await? {
            return Ok(());
        }

        info!(hypervisor = %self.name, network = %name, "Creating container network");
        let bridge_opt = format!("com.docker.network.bridge.name={}", name);
        let mut args = vec![
            "network", "create",
            "--driver", "bridge",
            "-o", bridge_opt.as_str(),
            "-o", "com.docker.network.bridge.inhibit_ipv4=true",
            "-o", "com.docker.network.bridge.enable_ip_masquerade=false",
        ];
        if let Some(subnet) = subnet {
            args.push("--subnet");
            args.push(subnet);
        }
        args.push(name);
        self.docker(&args).await?;
        Ok(())
    }

    /// Remove a network if no container is attached to it.
    async fn delete_unused_network(&self, name: &str) -> Result<()> {
        if !self.network_exists(name).await? {
            return Ok(());
        }
        let count = self
            .docker(&["network", "inspect", "-f", "{{len .Containers}}", name])
            .await?;
        if count.trim() == "0" {
            info!(hypervisor = %self.name, network = %name, "Deleting container network");
            self.docker(&["network", "rm", name]).await?;
        }
        Ok(())
    }

    async fn container_networks(&self, name: &str) -> Result<Vec<String>> {
        let out = self
            .docker(&[
                "inspect",
                "-f",
                "{{range $k, $v := .NetworkSettings.Networks}}{{$k}} {{end}}",
                name,
            ])
            .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn containers(&self) -> Result<BTreeMap<String, bool>> {
        let out = self
            .docker(&["ps", "-a", "--format", "{{.Names}}\t{{.State}}"])
            .await?;
        Ok(parse_ps(&out))
    }
}

#[async_trait]
impl Driver for ContainerDriver {
    async fn capabilities(&self) -> Result<DriverCapabilities> {
        let version = self
            .docker(&["version", "--format", "{{.Server.Version}}"])
            .await
            .unwrap_or_default();
        Ok(DriverCapabilities {
            name: "docker".to_string(),
            version: version.trim().to_string(),
            supports_graceful_shutdown: true,
            supports_network_update: false,
            supports_volumes: false,
            supports_link_discovery: true,
        })
    }

    #[instrument(skip(self), fields(hypervisor = %self.name))]
    async fn inventory(&self) -> Result<Inventory> {
        let domains = self.containers().await?;
        let networks = self
            .docker(&["network", "ls", "--format", "{{.Name}}"])
            .await?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| (l.trim().to_string(), true))
            .collect();

        let links = match self.discover_links().await {
            Ok(links) => links,
            Err(e) => {
                warn!(error = %e, "Link discovery failed");
                Vec::new()
            }
        };

        debug!(containers = domains.len(), links = links.len(), "Container inventory");
        Ok(Inventory {
            networks,
            domains,
            volumes: BTreeMap::new(),
            links,
        })
    }

    async fn state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        match resource {
            ResourceRef::Domain(name) => {
                let containers = self.containers().await?;
                Ok(match containers.get(name) {
                    None => ResourceState::Absent,
                    Some(true) => ResourceState::Active,
                    Some(false) => ResourceState::Inactive,
                })
            }
            ResourceRef::Network(name) => Ok(if self.network_exists(name).await? {
                ResourceState::Active
            } else {
                ResourceState::Absent
            }),
            ResourceRef::Volume { .. } => Ok(ResourceState::Absent),
        }
    }

    #[instrument(skip(self, network), fields(hypervisor = %self.name, network = %network.name))]
    async fn define_network(&self, network: &NetworkDefinition) -> Result<()> {
        self.ensure_network(&network.bridge, network.subnet.as_deref()).await
    }

    async fn update_network(&self, network: &NetworkDefinition) -> Result<()> {
        Err(DriverError::Unsupported(format!(
            "network update on container engine ({})",
            network.name
        )))
    }

    async fn create_volume(&self, volume: &VolumeDefinition) -> Result<()> {
        Err(DriverError::Unsupported(format!("volume {} on container engine", volume.name)))
    }

    async fn delete_volume(&self, _pool: &str, name: &str) -> Result<()> {
        Err(DriverError::Unsupported(format!("volume {} on container engine", name)))
    }

    #[instrument(skip(self, domain), fields(hypervisor = %self.name, container = %domain.name))]
    async fn define_domain(&self, domain: &DomainDefinition) -> Result<()> {
        let options = domain.container.clone().unwrap_or_default();
        let mgmt_network = domain.management.source.name().to_string();

        self.ensure_network(&mgmt_network, options.management_subnet.as_deref())
            .await?;
        for interface in &domain.interfaces {
            self.ensure_network(interface.source.name(), None).await?;
        }

        let args = create_args(domain, &options);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        info!(interfaces = domain.interfaces.len(), "Creating container");
        self.docker(&args).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(hypervisor = %self.name, resource = %resource))]
    async fn apply(&self, resource: &ResourceRef, action: PowerAction) -> Result<()> {
        let name = resource.name();
        match (resource, action) {
            (ResourceRef::Domain(_), PowerAction::Create) => {
                info!("Starting container");
                self.docker(&["start", name]).await?;
            }
            (ResourceRef::Domain(_), PowerAction::Shutdown | PowerAction::Destroy) => {
                info!("Stopping container");
                self.docker(&["stop", name]).await?;
            }
            (ResourceRef::Domain(_), PowerAction::Undefine) => {
                let networks = self.container_networks(name).await?;
                info!("Removing container");
                self.docker(&["rm", name]).await?;
                for network in networks {
                    self.delete_unused_network(&network).await?;
                }
            }
            (ResourceRef::Network(_), PowerAction::Undefine) => {
                self.delete_unused_network(name).await?;
            }
            // Container networks have no power state
            (ResourceRef::Network(_), _) => {}
            (ResourceRef::Volume { .. }, _) => {
                return Err(DriverError::Unsupported(format!("{} on volumes", action)));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, command), fields(hypervisor = %self.name))]
    async fn exec(&self, domain: &str, command: &str) -> Result<String> {
        debug!(command = %command, "Running command in container");
        self.docker(&["exec", domain, "sh", "-c", command]).await
    }

    async fn discover_links(&self) -> Result<Vec<DiscoveredLink>> {
        let host: Vec<IpLink> = parse_links(&self.host_ip(&["-j", "link", "show"]).await?)?;

        let mut containers = Vec::new();
        for (name, running) in self.containers().await? {
            if !running {
                continue;
            }
            match self.docker(&["exec", &name, "ip", "-j", "link", "show"]).await {
                Ok(out) => containers.push((name, parse_links(&out)?)),
                Err(e) => debug!(container = %name, error = %e, "Skipping container without ip tool"),
            }
        }

        Ok(classify_links(&host, &containers))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Run a command and return its stdout.
async fn run(mut cmd: Command, name: &str) -> Result<String> {
    let output = cmd
        .output()
        .await
        .map_err(|e| DriverError::CommandFailed {
            command: name.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(DriverError::CommandFailed {
            command: name.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Arguments of `docker create` for a domain definition.
fn create_args(domain: &DomainDefinition, options: &ContainerOptions) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        domain.name.clone(),
        "-i".to_string(),
        "-t".to_string(),
        "--security-opt".to_string(),
        "apparmor=unconfined".to_string(),
    ];

    let mut mgmt = format!(
        "name={},mac-address={}",
        domain.management.source.name(),
        domain.management.mac_address
    );
    if let Some(ip) = &domain.management.ip_address {
        mgmt.push_str(&format!(",ip={}", ip));
    }
    args.push("--network".to_string());
    args.push(mgmt);

    for interface in &domain.interfaces {
        args.push("--network".to_string());
        args.push(format!(
            "name={},mac-address={}",
            interface.source.name(),
            interface.mac_address
        ));
    }

    for env in &options.environment {
        args.push("-e".to_string());
        args.push(env.clone());
    }
    for cap in &options.capabilities {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    for device in &options.devices {
        args.push("--device".to_string());
        args.push(device.clone());
    }
    if options.privileged {
        args.push("--privileged".to_string());
    }
    if let Some((source, target)) = &options.config_mount {
        args.push("--mount".to_string());
        args.push(format!("type=bind,source={},target={}", source, target));
    }

    args.push(domain.template.clone());
    if let Some(command) = &options.command {
        args.extend(command.split_whitespace().map(str::to_string));
    }
    args
}

/// Parse `docker ps --format '{{.Names}}\t{{.State}}'` into name -> running.
fn parse_ps(out: &str) -> BTreeMap<String, bool> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let state = parts.next().unwrap_or("").trim();
            Some((name.to_string(), state == "running"))
        })
        .collect()
}

/// One entry of `ip -j link show`.
#[derive(Debug, Clone, Deserialize)]
pub struct IpLink {
    pub ifindex: u32,
    pub ifname: String,
    /// Index of the veth peer
    #[serde(default)]
    pub link_index: Option<u32>,
    /// Namespace id of the veth peer, set when it lives in another namespace
    #[serde(default)]
    pub link_netnsid: Option<i64>,
}

fn parse_links(out: &str) -> Result<Vec<IpLink>> {
    serde_json::from_str(out)
        .map_err(|e| DriverError::QueryFailed(format!("Invalid ip link output: {}", e)))
}

/// Pair container interfaces with their veth peers.
///
/// Two container interfaces pointing at each other are a cross-connect;
/// a container interface whose peer is a host `vtap-*` device is a tap.
pub fn classify_links(host: &[IpLink], containers: &[(String, Vec<IpLink>)]) -> Vec<DiscoveredLink> {
    let mut links = Vec::new();

    for (i, (a_name, a_links)) in containers.iter().enumerate() {
        for a in a_links.iter().filter(|l| l.link_netnsid.is_some()) {
            let Some(peer_index) = a.link_index else { continue };

            for (z_name, z_links) in containers.iter().skip(i + 1) {
                for z in z_links {
                    if z.ifindex == peer_index && z.link_index == Some(a.ifindex) {
                        links.push(DiscoveredLink {
                            kind: LinkKind::CrossConnect,
                            a_end: LinkEndpoint {
                                container: Some(a_name.clone()),
                                interface: a.ifname.clone(),
                            },
                            z_end: LinkEndpoint {
                                container: Some(z_name.clone()),
                                interface: z.ifname.clone(),
                            },
                        });
                    }
                }
            }

            for h in host.iter().filter(|h| h.ifname.starts_with("vtap-")) {
                if h.ifindex == peer_index && h.link_index == Some(a.ifindex) {
                    links.push(DiscoveredLink {
                        kind: LinkKind::Tap,
                        a_end: LinkEndpoint {
                            container: Some(a_name.clone()),
                            interface: a.ifname.clone(),
                        },
                        z_end: LinkEndpoint {
                            container: None,
                            interface: h.ifname.clone(),
                        },
                    });
                }
            }
        }
    }

    links
}
