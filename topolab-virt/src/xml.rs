//! XML generation for libvirt network, volume and domain definitions.
//!
//! Names and paths come from topology data, so every attribute and text
//! value goes through [`escape`].

use quick_xml::escape::escape;

use crate::types::*;

/// Namespace of the link metadata element read by the network hook script
/// that applies propagation delay to a bridge.
pub const LINK_METADATA_NS: &str = "https://topolab.dev/xmlns/link/1.0";

/// Name of the portgroup every network carries, rewritten on update so the
/// network hook runs again.
pub const DEFAULT_PORTGROUP: &str = "default";

/// Portgroup element used in a `VIR_NETWORK_SECTION_PORTGROUP` modify.
pub fn portgroup_xml() -> String {
    format!("<portgroup name='{}' default='yes'/>", DEFAULT_PORTGROUP)
}

// =============================================================================
// NETWORKS
// =============================================================================

/// Builder for libvirt network XML.
pub struct NetworkXmlBuilder<'a> {
    network: &'a NetworkDefinition,
    uuid: Option<&'a str>,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(network: &'a NetworkDefinition) -> Self {
        Self { network, uuid: None }
    }

    /// Reuse the UUID of an existing network so a redefine updates it in place.
    pub fn with_uuid(mut self, uuid: Option<&'a str>) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn build(&self) -> String {
        let mut xml = String::from("<network>\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(&self.network.name)));
        if let Some(uuid) = self.uuid {
            xml.push_str(&format!("  <uuid>{}</uuid>\n", escape(uuid)));
        }
        if let Some(delay) = self.network.delay_ms {
            xml.push_str(&format!(
                "  <metadata>\n    <topolab:link xmlns:topolab='{}' delay-ms='{}'/>\n  </metadata>\n",
                LINK_METADATA_NS, delay
            ));
        }
        xml.push_str(&format!(
            "  <bridge name='{}' stp='off' delay='0'/>\n",
            escape(&self.network.bridge)
        ));
        xml.push_str(&format!("  <mac address='{}'/>\n", self.network.mac_address));
        if self.network.isolated {
            xml.push_str("  <port isolated='yes'/>\n");
        }
        xml.push_str(&format!("  {}\n", portgroup_xml()));
        xml.push_str("</network>\n");
        xml
    }
}

// =============================================================================
// VOLUMES
// =============================================================================

/// Builder for libvirt storage volume XML.
pub struct VolumeXmlBuilder<'a> {
    volume: &'a VolumeDefinition,
    capacity_bytes: u64,
}

impl<'a> VolumeXmlBuilder<'a> {
    pub fn new(volume: &'a VolumeDefinition, capacity_bytes: u64) -> Self {
        Self { volume, capacity_bytes }
    }

    pub fn build(&self) -> String {
        format!(
            r#"<volume>
  <name>{}</name>
  <capacity unit='bytes'>{}</capacity>
  <target>
    <format type='{}'/>
  </target>
</volume>
"#,
            escape(&self.volume.name),
            self.capacity_bytes,
            self.volume.format.as_str()
        )
    }
}

// =============================================================================
// DOMAINS
// =============================================================================

/// Builder for libvirt domain XML.
///
/// Disk sources are resolved through a closure because only the daemon
/// knows the on-disk path of a pool volume.
pub struct DomainXmlBuilder<'a, F>
where
    F: Fn(&str, &str) -> String,
{
    domain: &'a DomainDefinition,
    volume_path: F,
}

impl<'a, F> DomainXmlBuilder<'a, F>
where
    F: Fn(&str, &str) -> String,
{
    pub fn new(domain: &'a DomainDefinition, volume_path: F) -> Self {
        Self { domain, volume_path }
    }

    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
  <os>
    <type arch='x86_64' machine='{}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
            escape(&self.domain.name),
            self.domain.memory_mib,
            self.domain.vcpus,
            self.machine()
        ));

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disks());
        for interface in self.domain.all_interfaces() {
            xml.push_str(&self.build_interface(interface));
        }
        xml.push_str(&self.build_console());
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");
        xml
    }

    fn machine(&self) -> &str {
        if self.domain.template.is_empty() {
            "pc"
        } else {
            &self.domain.template
        }
    }

    fn build_disks(&self) -> String {
        let mut xml = String::new();

        for disk in &self.domain.disks {
            let source = (self.volume_path)(&disk.pool, &disk.volume);
            let backing = disk
                .backing_store
                .as_ref()
                .map(|base| {
                    format!(
                        "      <backingStore type='file'>\n        <format type='qcow2'/>\n        <source file='{}'/>\n      </backingStore>\n",
                        escape(&(self.volume_path)(&disk.pool, base))
                    )
                })
                .unwrap_or_default();
            let readonly = if disk.device == DiskDevice::Cdrom {
                "      <readonly/>\n"
            } else {
                ""
            };

            xml.push_str(&format!(
                r#"    <disk type='file' device='{}'>
      <driver name='qemu' type='{}'/>
      <source file='{}'/>
{}      <target dev='{}' bus='{}'/>
{}    </disk>
"#,
                disk.device.as_str(),
                disk.format.as_str(),
                escape(&source),
                backing,
                escape(&disk.target),
                escape(&disk.bus),
                readonly
            ));
        }

        xml
    }

    fn build_interface(&self, interface: &InterfaceAttachment) -> String {
        let (kind, source) = match &interface.source {
            InterfaceSource::Network(name) => ("network", format!("      <source network='{}'/>\n", escape(name))),
            InterfaceSource::Bridge(name) => ("bridge", format!("      <source bridge='{}'/>\n", escape(name))),
            InterfaceSource::Udp { address, local_port, remote_port } => (
                "udp",
                format!(
                    "      <source address='{0}' port='{1}'>\n        <local address='{0}' port='{2}'/>\n      </source>\n",
                    escape(address),
                    remote_port,
                    local_port
                ),
            ),
        };
        let target = interface
            .target_dev
            .as_ref()
            .map(|dev| format!("      <target dev='{}'/>\n", escape(dev)))
            .unwrap_or_default();

        format!(
            r#"    <interface type='{}'>
      <mac address='{}'/>
{}{}      <model type='{}'/>
    </interface>
"#,
            kind,
            interface.mac_address,
            source,
            target,
            interface.model.as_str()
        )
    }

    fn build_console(&self) -> String {
        format!(
            r#"    <serial type='tcp'>
      <source mode='bind' host='0.0.0.0' service='{}'/>
      <protocol type='telnet'/>
      <target port='0'/>
    </serial>
    <console type='tcp'>
      <source mode='bind' host='0.0.0.0' service='{}'/>
      <protocol type='telnet'/>
      <target type='serial' port='0'/>
    </console>
"#,
            console_port(self.domain.device_id),
            console_port(self.domain.device_id)
        )
    }
}

/// TCP port of a device's serial console: `160` followed by the two digit id.
pub fn console_port(device_id: u32) -> String {
    format!("160{:02}", device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(a: u8, b: u8) -> MacAddress {
        MacAddress::from_parts([0x52, 0x54, 0x00], [0x00, a, b])
    }

    #[test]
    fn test_network_xml() {
        let network = NetworkDefinition::new("net-3-null", "vbr-3-null", mac(0x03, 0x00))
            .with_isolated(true);
        let xml = NetworkXmlBuilder::new(&network).with_uuid(Some("abcd")).build();

        assert!(xml.contains("<name>net-3-null</name>"));
        assert!(xml.contains("<uuid>abcd</uuid>"));
        assert!(xml.contains("<bridge name='vbr-3-null' stp='off' delay='0'/>"));
        assert!(xml.contains("<mac address='52:54:00:00:03:00'/>"));
        assert!(xml.contains("<port isolated='yes'/>"));
        assert!(!xml.contains("delay-ms"));
    }

    #[test]
    fn test_network_delay_metadata() {
        let network =
            NetworkDefinition::new("net-1-2", "vbr-1-2", mac(0x01, 0x02)).with_delay(Some(25));
        let xml = NetworkXmlBuilder::new(&network).build();

        assert!(xml.contains("delay-ms='25'"));
        assert!(!xml.contains("<uuid>"));
        assert!(!xml.contains("isolated"));
    }

    #[test]
    fn test_domain_xml() {
        let domain = DomainDefinition::new(
            "r<1>",
            7,
            InterfaceAttachment {
                source: InterfaceSource::Bridge("virbr0".to_string()),
                mac_address: mac(0x07, 0xff),
                model: NicModel::E1000,
                target_dev: Some("vtap-7-virbr0".to_string()),
                slot: None,
                ip_address: None,
            },
        )
        .with_disk(DiskAttachment {
            pool: "default".to_string(),
            volume: "r1.qcow2".to_string(),
            device: DiskDevice::Disk,
            format: VolumeFormat::Qcow2,
            target: "vda".to_string(),
            bus: "virtio".to_string(),
            backing_store: Some("base.qcow2".to_string()),
        })
        .with_interface(InterfaceAttachment {
            source: InterfaceSource::Network("net-1-7".to_string()),
            mac_address: mac(0x07, 0x01),
            model: NicModel::E1000,
            target_dev: Some("vtap-7-1".to_string()),
            slot: Some(1),
            ip_address: None,
        });

        let xml = DomainXmlBuilder::new(&domain, |pool, vol| format!("/pools/{}/{}", pool, vol))
            .build();

        assert!(xml.contains("<name>r&lt;1&gt;</name>"));
        assert!(xml.contains("<source file='/pools/default/r1.qcow2'/>"));
        assert!(xml.contains("<source file='/pools/default/base.qcow2'/>"));
        assert!(xml.contains("service='16007'"));

        let mgmt = xml.find("vtap-7-virbr0").unwrap();
        let data = xml.find("vtap-7-1").unwrap();
        assert!(mgmt < data);
        assert!(xml.contains("<source network='net-1-7'/>"));
        assert!(xml.contains("<model type='e1000'/>"));
    }

    #[test]
    fn test_udp_interface_xml() {
        let domain = DomainDefinition::new(
            "r1",
            1,
            InterfaceAttachment {
                source: InterfaceSource::Bridge("virbr0".to_string()),
                mac_address: mac(0x01, 0xff),
                model: NicModel::Virtio,
                target_dev: None,
                slot: None,
                ip_address: None,
            },
        )
        .with_interface(InterfaceAttachment {
            source: InterfaceSource::Udp { address: "127.0.0.1".to_string(), local_port: 10102, remote_port: 10201 },
            mac_address: mac(0x01, 0x02),
            model: NicModel::Virtio,
            target_dev: None,
            slot: Some(2),
            ip_address: None,
        });

        let xml = DomainXmlBuilder::new(&domain, |pool, vol| format!("/pools/{}/{}", pool, vol)).build();

        assert!(xml.contains("<interface type='udp'>"));
        assert!(xml.contains("<source address='127.0.0.1' port='10201'>"));
        assert!(xml.contains("<local address='127.0.0.1' port='10102'/>"));
    }

    #[test]
    fn test_console_port() {
        assert_eq!(console_port(3), "16003");
        assert_eq!(console_port(42), "16042");
    }
}
