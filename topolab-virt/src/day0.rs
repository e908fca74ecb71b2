//! Day-0 configuration image packaging.
//!
//! A device's first-boot configuration is rendered by the orchestrator and
//! handed to a [`Day0Packager`], which turns it into the byte image that is
//! uploaded into the device's day-0 volume:
//!
//! - `Raw` - rendered text as-is
//! - `Fat` - 1 MiB FAT12 floppy-style disk holding one file
//! - `JunosFat` - FAT disk holding `vmm-config.tgz` with `/config/juniper.conf`
//! - `Iso` - ISO 9660 image (cloud-init `cidata`, IOS-XR `config-1`)
//!
//! [`SystemPackager`] shells out to the usual host tools (`mkfs.fat`,
//! `mcopy`, `sfdisk`, `tar`, `genisoimage`/`mkisofs`/`xorrisofs`, `openssl`).

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{DriverError, Result};

/// Disk geometry used for FAT day-0 images.
const DISK_SIZE: u64 = 1024 * 1024;
const BYTES_PER_SECTOR: u64 = 512;
const SECTORS_PER_TRACK: u64 = 63;
const HEADS: u64 = 2;

/// A day-0 image to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Day0Image {
    /// Rendered text uploaded verbatim.
    Raw { content: String },
    /// FAT disk with a single file in its root.
    Fat {
        file_name: String,
        content: String,
        partition_table: bool,
    },
    /// FAT disk holding a gzipped tar of the Junos configuration.
    JunosFat {
        config: String,
        /// `/boot/loader.conf` content, added when present
        loader: Option<String>,
        partition_table: bool,
    },
    /// ISO 9660 image with the given volume id.
    Iso {
        volume_id: String,
        files: Vec<(String, String)>,
    },
}

/// Password hash flavours offered to day-0 templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordScheme {
    /// `$6$` SHA-512 crypt
    Sha512,
    /// `$1$` MD5 crypt
    Md5,
}

/// Builds day-0 images and password hashes.
#[async_trait]
pub trait Day0Packager: Send + Sync {
    /// Produce the bytes of a day-0 image.
    async fn package(&self, image: &Day0Image) -> Result<Vec<u8>>;

    /// Hash a plaintext password for embedding in a configuration.
    async fn hash_password(&self, plain: &str, scheme: PasswordScheme) -> Result<String>;
}

// =============================================================================
// SYSTEM PACKAGER
// =============================================================================

/// Packager backed by host command line tools.
pub struct SystemPackager {
    iso_tool: String,
}

impl Default for SystemPackager {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPackager {
    pub fn new() -> Self {
        Self {
            iso_tool: Self::find_iso_tool(),
        }
    }

    /// Find the ISO generation tool.
    fn find_iso_tool() -> String {
        for tool in ["genisoimage", "mkisofs", "xorrisofs"] {
            if Command::new(tool).arg("--version").output().is_ok() {
                return tool.to_string();
            }
        }
        "genisoimage".to_string()
    }

    fn build(iso_tool: &str, image: &Day0Image) -> Result<Vec<u8>> {
        match image {
            Day0Image::Raw { content } => Ok(content.as_bytes().to_vec()),
            Day0Image::Fat { file_name, content, partition_table } => {
                let staging = staging_dir()?;
                let source = staging.path().join(file_name);
                write_file(&source, content.as_bytes())?;
                fat_image(staging.path(), &source, file_name, *partition_table)
            }
            Day0Image::JunosFat { config, loader, partition_table } => {
                let staging = staging_dir()?;
                let tree = staging.path().join("tree");
                create_dir(&tree.join("config"))?;
                write_file(&tree.join("config/juniper.conf"), config.as_bytes())?;

                let mut entries = vec!["config"];
                if let Some(loader) = loader {
                    create_dir(&tree.join("boot"))?;
                    write_file(&tree.join("boot/loader.conf"), loader.as_bytes())?;
                    entries.push("boot");
                }

                let archive = staging.path().join("vmm-config.tgz");
                let mut tar = Command::new("tar");
                tar.arg("-czf").arg(&archive).arg("-C").arg(&tree).args(&entries);
                run(&mut tar, "tar")?;

                fat_image(staging.path(), &archive, "vmm-config.tgz", *partition_table)
            }
            Day0Image::Iso { volume_id, files } => {
                let staging = staging_dir()?;
                let tree = staging.path().join("tree");
                create_dir(&tree)?;
                for (name, content) in files {
                    write_file(&tree.join(name), content.as_bytes())?;
                }

                let iso = staging.path().join("day0.iso");
                let mut cmd = Command::new(iso_tool);
                cmd.arg("-output")
                    .arg(&iso)
                    .args(["-volid", volume_id.as_str(), "-joliet", "-rock"])
                    .arg(&tree);
                run(&mut cmd, iso_tool)?;

                read_file(&iso)
            }
        }
    }

    fn hash(plain: &str, scheme: PasswordScheme) -> Result<String> {
        let flag = match scheme {
            PasswordScheme::Sha512 => "-6",
            PasswordScheme::Md5 => "-1",
        };

        let mut child = Command::new("openssl")
            .args(["passwd", flag, "-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::Packaging(format!("Failed to run openssl: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", plain).as_bytes())
                .map_err(|e| DriverError::Packaging(format!("Failed to write to openssl: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| DriverError::Packaging(format!("openssl failed: {}", e)))?;
        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                command: "openssl passwd".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Day0Packager for SystemPackager {
    #[instrument(skip(self, image))]
    async fn package(&self, image: &Day0Image) -> Result<Vec<u8>> {
        let iso_tool = self.iso_tool.clone();
        let image = image.clone();
        let bytes = tokio::task::spawn_blocking(move || Self::build(&iso_tool, &image))
            .await
            .map_err(|e| DriverError::Internal(format!("Packaging task failed: {}", e)))??;

        info!(size = bytes.len(), "Day-0 image packaged");
        Ok(bytes)
    }

    async fn hash_password(&self, plain: &str, scheme: PasswordScheme) -> Result<String> {
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || Self::hash(&plain, scheme))
            .await
            .map_err(|e| DriverError::Internal(format!("Hashing task failed: {}", e)))?
    }
}

/// Layout of the FAT image: (total bytes, first partition sector, sector count).
pub fn fat_geometry(partition_table: bool) -> (u64, u64, u64) {
    let sectors = DISK_SIZE / BYTES_PER_SECTOR;
    let actual_sectors = sectors / SECTORS_PER_TRACK * SECTORS_PER_TRACK;
    let first_sector = if partition_table { SECTORS_PER_TRACK } else { 0 };
    (actual_sectors * BYTES_PER_SECTOR, first_sector, actual_sectors)
}

/// Build a FAT12 disk image containing `source` as `/<name>`.
fn fat_image(staging: &Path, source: &Path, name: &str, partition_table: bool) -> Result<Vec<u8>> {
    let (size, first_sector, total_sectors) = fat_geometry(partition_table);
    let disk = staging.join("disk.img");
    write_file(&disk, &vec![0u8; size as usize])?;

    if partition_table {
        // Single bootable FAT12 primary partition spanning the disk
        let script = format!(
            "{},{},1,*\n",
            first_sector,
            total_sectors - first_sector
        );
        let mut sfdisk = Command::new("sfdisk");
        sfdisk.arg("--no-reread").arg("--no-tell-kernel").arg(&disk);
        run_with_input(&mut sfdisk, "sfdisk", &script)?;
    }

    let geometry = format!("{}/{}", HEADS, SECTORS_PER_TRACK);
    let offset = first_sector.to_string();
    let mut mkfs = Command::new("mkfs.fat");
    mkfs.args([
        "-F", "12",
        "-g", geometry.as_str(),
        "-h", "1",
        "-R", "8",
        "-s", "8",
        "--offset", offset.as_str(),
    ])
    .arg(&disk);
    run(&mut mkfs, "mkfs.fat")?;

    let mut mcopy = Command::new("mcopy");
    mcopy
        .arg("-i")
        .arg(format!(
            "{}@@{}",
            disk.display(),
            first_sector * BYTES_PER_SECTOR
        ))
        .arg(source)
        .arg(format!("::/{}", name));
    run(&mut mcopy, "mcopy")?;

    debug!(name = %name, partition_table, "FAT day-0 image built");
    read_file(&disk)
}

fn staging_dir() -> Result<tempfile::TempDir> {
    tempfile::tempdir()
        .map_err(|e| DriverError::Packaging(format!("Failed to create temp dir: {}", e)))
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| DriverError::Packaging(format!("Failed to create {}: {}", path.display(), e)))
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content)
        .map_err(|e| DriverError::Packaging(format!("Failed to write {}: {}", path.display(), e)))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| DriverError::Packaging(format!("Failed to read {}: {}", path.display(), e)))
}

fn run(cmd: &mut Command, name: &str) -> Result<()> {
    let output = cmd
        .output()
        .map_err(|e| DriverError::Packaging(format!("Failed to run {}: {}", name, e)))?;
    if !output.status.success() {
        return Err(DriverError::CommandFailed {
            command: name.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn run_with_input(cmd: &mut Command, name: &str, input: &str) -> Result<()> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DriverError::Packaging(format!("Failed to run {}: {}", name, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .map_err(|e| DriverError::Packaging(format!("Failed to write to {}: {}", name, e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| DriverError::Packaging(format!("{} failed: {}", name, e)))?;
    if !output.status.success() {
        return Err(DriverError::CommandFailed {
            command: name.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// MOCK PACKAGER
// =============================================================================

/// Packager that needs no host tools.
///
/// Images are serialized as JSON so tests can inspect what would have been
/// packaged; hashes are `<scheme>$<plain>`.
#[derive(Debug, Default)]
pub struct MockPackager;

#[async_trait]
impl Day0Packager for MockPackager {
    async fn package(&self, image: &Day0Image) -> Result<Vec<u8>> {
        match image {
            Day0Image::Raw { content } => Ok(content.as_bytes().to_vec()),
            other => serde_json::to_vec(other)
                .map_err(|e| DriverError::Packaging(format!("Failed to encode image: {}", e))),
        }
    }

    async fn hash_password(&self, plain: &str, scheme: PasswordScheme) -> Result<String> {
        let tag = match scheme {
            PasswordScheme::Sha512 => "6",
            PasswordScheme::Md5 => "1",
        };
        Ok(format!("${}${}", tag, plain))
    }
}
