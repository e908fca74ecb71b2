//! Day-0 artifact builder.
//!
//! Collects the variables of a device's first-boot configuration, renders
//! the definition's day-0 template and packages the result in the format
//! the device profile asks for.

use base64::Engine;
use tracing::{debug, info};

use topolab_virt::{Day0Image, Day0Packager, PasswordScheme};

use crate::allocator::{data_ip, ResourceAllocator, MGMT_OCTET};
use crate::error::{OrchestratorError, Result};
use crate::model::{AuthGroup, Device, DeviceDefinition};
use crate::profiles::{Day0Format, DeviceProfile};
use crate::resolver::NetworkResolver;
use crate::store::{InterfacePatch, TopologyChange};
use crate::template::{TemplateRenderer, Variables};

/// Everything needed to build one device's artifact.
pub struct Day0Request<'a> {
    pub device: &'a Device,
    pub definition: &'a DeviceDefinition,
    pub profile: &'a DeviceProfile,
    pub authgroup: Option<&'a AuthGroup>,
    pub allocator: &'a ResourceAllocator,
    pub resolver: &'a NetworkResolver,
}

/// A packaged artifact plus the store updates it implies.
#[derive(Debug, Clone)]
pub struct Day0Artifact {
    pub bytes: Vec<u8>,
    pub write_backs: Vec<TopologyChange>,
}

pub struct Day0Builder<'a> {
    renderer: &'a dyn TemplateRenderer,
    packager: &'a dyn Day0Packager,
}

impl<'a> Day0Builder<'a> {
    pub fn new(renderer: &'a dyn TemplateRenderer, packager: &'a dyn Day0Packager) -> Self {
        Self { renderer, packager }
    }

    /// Template variables of a device.
    pub async fn variables(&self, request: &Day0Request<'_>) -> Result<Variables> {
        let id = request.device.id;
        let mut variables = Variables::new();
        variables.insert("device-name".to_string(), request.device.name.clone());
        variables.insert("ip-address".to_string(), request.allocator.mgmt_ip(id)?.to_string());
        variables.insert(
            "mac-address".to_string(),
            request.allocator.interface_mac(id, MGMT_OCTET)?.to_string(),
        );

        if let Some(auth) = request.authgroup {
            variables.insert("username".to_string(), auth.username.clone());
            variables.insert(
                "password".to_string(),
                self.packager.hash_password(&auth.password, PasswordScheme::Sha512).await?,
            );
            variables.insert(
                "password-md5".to_string(),
                self.packager.hash_password(&auth.password, PasswordScheme::Md5).await?,
            );
        }
        variables.extend(request.allocator.template_variables());

        if let Some(path) = &request.definition.day0_upload_file {
            let content = tokio::fs::read(path)
                .await
                .map_err(|e| OrchestratorError::Render(format!("{}: {}", path, e)))?;
            variables.insert(
                "file-content".to_string(),
                base64::engine::general_purpose::STANDARD.encode(content),
            );
        }

        Ok(variables)
    }

    /// Render and package the day-0 artifact. `None` when the definition
    /// has no day-0 file.
    pub async fn build(&self, request: &Day0Request<'_>) -> Result<Option<Day0Artifact>> {
        let Some(day0_file) = &request.definition.day0_file else {
            return Ok(None);
        };

        let variables = self.variables(request).await?;
        let content = self.renderer.render(day0_file, &variables).await?;
        let mut write_backs = Vec::new();

        let image = match &request.profile.day0_format {
            Day0Format::Text => Day0Image::Raw { content },
            Day0Format::Fat { file_name, partition_table } => Day0Image::Fat {
                file_name: file_name.to_string(),
                content,
                partition_table: *partition_table,
            },
            Day0Format::JunosFat { loader_template, partition_table } => {
                let loader = match loader_template {
                    Some(template) => Some(self.renderer.render(template, &Variables::new()).await?),
                    None => None,
                };
                Day0Image::JunosFat {
                    config: content,
                    loader,
                    partition_table: *partition_table,
                }
            }
            Day0Format::Iso { file_name, volume_id } => Day0Image::Iso {
                volume_id: volume_id.to_string(),
                files: vec![(file_name.to_string(), content)],
            },
            Day0Format::CloudInit => {
                let meta_data = self.renderer.render("meta-data.yaml", &variables).await?;
                let mut network_config = self.renderer.render("network-config.yaml", &variables).await?;
                network_config.push_str(&self.cloud_init_ethernets(request, &mut write_backs).await?);
                Day0Image::Iso {
                    volume_id: "cidata".to_string(),
                    files: vec![
                        ("meta-data".to_string(), meta_data),
                        ("network-config".to_string(), network_config),
                        ("user-data".to_string(), content),
                    ],
                }
            }
        };

        debug!(device = %request.device.name, image = ?image, "Packaging day-0 image");
        let bytes = self.packager.package(&image).await?;
        info!(device = %request.device.name, size = bytes.len(), "Built day-0 image");
        Ok(Some(Day0Artifact { bytes, write_backs }))
    }

    /// One `ethernet.yaml` block per interface on a network with a data
    /// subnet; the derived address is written back to the interface.
    async fn cloud_init_ethernets(
        &self,
        request: &Day0Request<'_>,
        write_backs: &mut Vec<TopologyChange>,
    ) -> Result<String> {
        let id = request.device.id;
        let resolver = request.resolver;
        let mut out = String::new();

        for iface in 0..resolver.num_interfaces() {
            let Some(key) = resolver
                .iface_network(id, iface)
                .or_else(|| resolver.iface_bridge(id, iface))
            else {
                continue;
            };
            let Some(start) = resolver.network_subnet(key) else {
                continue;
            };

            let ip = data_ip(start, id)?.to_string();
            let mut variables = Variables::new();
            variables.insert("iface-id".to_string(), iface.to_string());
            variables.insert("ip-address".to_string(), ip.clone());
            variables.insert(
                "mac-address".to_string(),
                request.allocator.interface_mac(id, iface)?.to_string(),
            );
            out.push_str(&self.renderer.render("ethernet.yaml", &variables).await?);

            if let Some(slot) = resolver.iface_slot(id, iface) {
                write_backs.push(TopologyChange::Interface {
                    slot: slot.clone(),
                    patch: InterfacePatch { ip_address: Some(ip), ..Default::default() },
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::placement::Placement;
    use crate::profiles::ProfileRegistry;
    use crate::template::MemoryRenderer;
    use topolab_virt::MockPackager;

    struct Fixture {
        topology: Topology,
        resolver: NetworkResolver,
        allocator: ResourceAllocator,
    }

    fn fixture() -> Fixture {
        let hypervisor = Hypervisor {
            name: "hv1".to_string(),
            management_network: ManagementNetwork {
                ip_address_start: Some("192.168.0.0".parse().unwrap()),
                gateway_address: Some("192.168.0.254".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let topology = Topology {
            name: "lab".to_string(),
            devices: vec![
                Device { id: 1, name: "h1".to_string(), ..Default::default() },
                Device { id: 2, name: "h2".to_string(), ..Default::default() },
            ],
            networks: vec![Network {
                name: "lan".to_string(),
                ipv4_subnet_start: Some("10.9.8".to_string()),
                interface_id: Some(0),
                devices: vec![
                    NetworkMember { name: "h1".to_string(), ..Default::default() },
                    NetworkMember { name: "h2".to_string(), ..Default::default() },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let lab = Lab {
            default_hypervisor: Some("hv1".to_string()),
            hypervisors: vec![hypervisor.clone()],
            ..Default::default()
        };
        let placement = Placement::new(&lab, &topology).unwrap();
        Fixture {
            resolver: NetworkResolver::new(&topology, &placement).unwrap(),
            allocator: ResourceAllocator::new(&hypervisor).unwrap(),
            topology,
        }
    }

    fn definition(day0: Option<&str>) -> DeviceDefinition {
        DeviceDefinition {
            name: "def".to_string(),
            day0_file: day0.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_variables() {
        let f = fixture();
        let def = definition(Some("day0.txt"));
        let auth = AuthGroup { name: "default".to_string(), username: "admin".to_string(), password: "secret".to_string() };
        let profile = DeviceProfile::default();
        let request = Day0Request {
            device: &f.topology.devices[1],
            definition: &def,
            profile: &profile,
            authgroup: Some(&auth),
            allocator: &f.allocator,
            resolver: &f.resolver,
        };

        let renderer = MemoryRenderer::new();
        let vars = Day0Builder::new(&renderer, &MockPackager).variables(&request).await.unwrap();
        assert_eq!(vars["device-name"], "h2");
        assert_eq!(vars["ip-address"], "192.168.0.2");
        assert_eq!(vars["mac-address"], "52:54:00:01:02:ff");
        assert_eq!(vars["username"], "admin");
        assert_eq!(vars["password"], "$6$secret");
        assert_eq!(vars["password-md5"], "$1$secret");
        assert_eq!(vars["gateway-address"], "192.168.0.254");
        assert!(!vars.contains_key("file-content"));
    }

    #[tokio::test]
    async fn test_no_day0_file() {
        let f = fixture();
        let def = definition(None);
        let profile = DeviceProfile::default();
        let request = Day0Request {
            device: &f.topology.devices[0],
            definition: &def,
            profile: &profile,
            authgroup: None,
            allocator: &f.allocator,
            resolver: &f.resolver,
        };
        let renderer = MemoryRenderer::new();
        assert!(Day0Builder::new(&renderer, &MockPackager).build(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_text_artifact_with_upload_file() {
        let f = fixture();
        let upload = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(upload.path(), b"abc").unwrap();
        let mut def = definition(Some("day0.txt"));
        def.day0_upload_file = Some(upload.path().display().to_string());
        let profile = DeviceProfile::default();
        let request = Day0Request {
            device: &f.topology.devices[0],
            definition: &def,
            profile: &profile,
            authgroup: None,
            allocator: &f.allocator,
            resolver: &f.resolver,
        };

        let renderer = MemoryRenderer::new().with_template("day0.txt", "hostname ${device-name}\n${file-content}");
        let artifact = Day0Builder::new(&renderer, &MockPackager).build(&request).await.unwrap().unwrap();
        assert_eq!(artifact.bytes, b"hostname h1\nYWJj");
        assert!(artifact.write_backs.is_empty());
    }

    #[tokio::test]
    async fn test_cloud_init_artifact() {
        let f = fixture();
        let def = definition(Some("user-data.yaml"));
        let registry = ProfileRegistry::new();
        let request = Day0Request {
            device: &f.topology.devices[1],
            definition: &def,
            profile: registry.get("Linux"),
            authgroup: None,
            allocator: &f.allocator,
            resolver: &f.resolver,
        };

        let renderer = MemoryRenderer::new()
            .with_template("user-data.yaml", "#cloud-config\n")
            .with_template("meta-data.yaml", "local-hostname: ${device-name}\n")
            .with_template("network-config.yaml", "version: 2\n")
            .with_template("ethernet.yaml", "eth${iface-id}: ${ip-address} ${mac-address}\n");

        let artifact = Day0Builder::new(&renderer, &MockPackager).build(&request).await.unwrap().unwrap();
        let image: Day0Image = serde_json::from_slice(&artifact.bytes).unwrap();
        let Day0Image::Iso { volume_id, files } = image else {
            panic!("expected an ISO image");
        };
        assert_eq!(volume_id, "cidata");
        assert_eq!(files[0], ("meta-data".to_string(), "local-hostname: h2\n".to_string()));
        assert_eq!(
            files[1].1,
            "version: 2\neth0: 10.9.8.2 52:54:00:01:02:00\n"
        );
        assert_eq!(artifact.write_backs.len(), 1);
    }

    #[tokio::test]
    async fn test_junos_loader_is_rendered() {
        let f = fixture();
        let def = definition(Some("juniper.conf"));
        let registry = ProfileRegistry::new();
        let request = Day0Request {
            device: &f.topology.devices[0],
            definition: &def,
            profile: registry.get("vMX"),
            authgroup: None,
            allocator: &f.allocator,
            resolver: &f.resolver,
        };
        let renderer = MemoryRenderer::new()
            .with_template("juniper.conf", "system { host-name ${device-name}; }")
            .with_template("junos-vmx-loader.conf", "vmx_chassis_type=\"lite\"\n");

        let artifact = Day0Builder::new(&renderer, &MockPackager).build(&request).await.unwrap().unwrap();
        let image: Day0Image = serde_json::from_slice(&artifact.bytes).unwrap();
        assert_eq!(
            image,
            Day0Image::JunosFat {
                config: "system { host-name h1; }".to_string(),
                loader: Some("vmx_chassis_type=\"lite\"\n".to_string()),
                partition_table: false,
            }
        );
    }
}
