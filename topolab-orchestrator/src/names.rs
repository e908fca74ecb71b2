//! Derived resource names.
//!
//! Names are pure functions of device ids and device names so repeated
//! runs address the same backend resources.

/// Network id of a link between two devices, or of a device's isolated
/// network when `other` is `None`.
pub fn network_id(device_id: u32, other: Option<u32>) -> String {
    match other {
        Some(other) => format!("{}-{}", device_id, other),
        None => format!("{}-null", device_id),
    }
}

/// Network id of a link, independent of endpoint order.
pub fn link_network_id(a: u32, z: u32) -> (String, (u32, u32)) {
    let pair = sorted_pair(a, z);
    (network_id(pair.0, Some(pair.1)), pair)
}

pub fn sorted_pair(a: u32, z: u32) -> (u32, u32) {
    if a <= z {
        (a, z)
    } else {
        (z, a)
    }
}

/// Backend network name.
pub fn network_name(network_id: &str) -> String {
    format!("net-{}", network_id)
}

/// Host bridge name.
pub fn bridge_name(network_id: &str) -> String {
    format!("vbr-{}", network_id)
}

/// Host tap device of a domain interface.
pub fn tap_name(device_id: u32, other: impl std::fmt::Display) -> String {
    format!("vtap-{}-{}", device_id, other)
}

/// UDP port of a tunnelled interface: `1<device:02><iface:02>`. `None`
/// when either id has more than two digits.
pub fn udp_port(device_id: u32, iface_id: u32) -> Option<u16> {
    if device_id > 99 || iface_id > 99 {
        return None;
    }
    u16::try_from(10_000 + device_id * 100 + iface_id).ok()
}

/// Main disk volume.
pub fn volume_name(device_name: &str) -> String {
    format!("{}.qcow2", device_name)
}

/// Day-0 configuration volume.
pub fn day0_volume_name(device_name: &str) -> String {
    format!("{}-day0.img", device_name)
}
