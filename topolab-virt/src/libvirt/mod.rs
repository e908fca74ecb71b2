//! Libvirt driver.
//!
//! Networks, storage volumes and domains are managed through a libvirt
//! daemon. Requires the `libvirt` feature and a system libvirt.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtDriver;

/// Check if the libvirt driver is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
