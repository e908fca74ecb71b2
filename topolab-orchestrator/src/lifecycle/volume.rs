//! Disk and day-0 volumes.
//!
//! Volumes live in the definition's storage pool on the hypervisor's
//! libvirt connection, whatever backend runs the device. Only `define`
//! and `undefine` touch them.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use topolab_virt::{ResourceRef, ResourceState, VolumeDefinition, VolumeFormat, VolumeSource};

use super::{live_state, Action, ActionReport, DeviceContext, RunContext, VolumeController};
use crate::cache::BackendKind;
use crate::day0::{Day0Builder, Day0Request};
use crate::error::Result;
use crate::model::BaseImageType;
use crate::names;

pub struct PoolVolumes;

impl PoolVolumes {
    /// Main disk definition, for VM profiles with a base image.
    fn main_volume(device: &DeviceContext<'_>) -> Option<VolumeDefinition> {
        if !device.profile.is_vm() {
            return None;
        }
        let base_image = device.definition.base_image.clone()?;
        let source = match device.definition.base_image_type {
            BaseImageType::BackingStore => VolumeSource::Backing { base_image },
            BaseImageType::Clone => VolumeSource::Clone { base_image },
        };
        Some(VolumeDefinition {
            name: names::volume_name(device.name()),
            pool: device.definition.storage_pool.clone(),
            format: VolumeFormat::Qcow2,
            source,
            resize_gib: device.definition.disk_size,
        })
    }

    async fn define(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        report: &mut ActionReport,
    ) -> Result<()> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Libvirt).await?;
        let pool = &device.definition.storage_pool;

        if let Some(volume) = Self::main_volume(device) {
            let resource = ResourceRef::volume(pool, &volume.name);
            if live_state(&connection, &resource).await? == ResourceState::Absent {
                connection.driver.create_volume(&volume).await?;
                report.volume(&device.hypervisor.name, &volume.name);
                info!(volume = %volume.name, resize_gib = ?volume.resize_gib, "Created disk volume");
            }
        }

        let day0_name = names::day0_volume_name(device.name());
        let resource = ResourceRef::volume(pool, &day0_name);
        if live_state(&connection, &resource).await? != ResourceState::Absent {
            debug!(volume = %day0_name, "Day-0 volume exists");
            return Ok(());
        }

        let request = Day0Request {
            device: device.device,
            definition: device.definition,
            profile: device.profile,
            authgroup: device.definition.authgroup.as_deref().and_then(|name| ctx.lab.authgroup(name)),
            allocator: device.allocator,
            resolver: ctx.resolver,
        };
        let Some(artifact) = Day0Builder::new(ctx.renderer, ctx.packager).build(&request).await? else {
            return Ok(());
        };

        connection
            .driver
            .create_volume(&VolumeDefinition {
                name: day0_name.clone(),
                pool: pool.clone(),
                format: VolumeFormat::Raw,
                source: VolumeSource::Upload(artifact.bytes),
                resize_gib: None,
            })
            .await?;
        ctx.write_all(artifact.write_backs).await?;
        report.volume(&device.hypervisor.name, &day0_name);
        info!(volume = %day0_name, "Created day-0 volume");
        Ok(())
    }

    async fn undefine(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        report: &mut ActionReport,
    ) -> Result<()> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Libvirt).await?;
        let pool = &device.definition.storage_pool;

        for name in [names::volume_name(device.name()), names::day0_volume_name(device.name())] {
            let resource = ResourceRef::volume(pool, &name);
            if live_state(&connection, &resource).await?.exists() {
                connection.driver.delete_volume(pool, &name).await?;
                report.volume(&device.hypervisor.name, &name);
                info!(volume = %name, "Deleted volume");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeController for PoolVolumes {
    #[instrument(skip(self, ctx, device, report), fields(device = %device.name(), action = %action))]
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<()> {
        match action {
            Action::Define => self.define(ctx, device, report).await,
            Action::Undefine => self.undefine(ctx, device, report).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceDefinition;
    use crate::template::MemoryRenderer;
    use crate::testing::Harness;

    fn harness() -> Harness {
        Harness::new(&[(1, "r1", None)])
            .with_definition(DeviceDefinition {
                name: "vm".to_string(),
                base_image: Some("base.qcow2".to_string()),
                base_image_type: BaseImageType::Clone,
                disk_size: Some(8),
                day0_file: Some("day0.txt".to_string()),
                authgroup: Some("default".to_string()),
                ..Default::default()
            })
            .with_renderer(MemoryRenderer::new().with_template("day0.txt", "hostname ${device-name}\nuser ${username}\n"))
    }

    #[tokio::test]
    async fn test_define_creates_disk_and_day0_once() {
        let harness = harness();
        let run = harness.run();
        let ctx = run.context();
        let device = ctx.device(&ctx.topology.devices[0]).unwrap();
        let mut report = ActionReport::new(Action::Define);

        PoolVolumes.apply(&ctx, &device, Action::Define, &mut report).await.unwrap();
        PoolVolumes.apply(&ctx, &device, Action::Define, &mut report).await.unwrap();

        let driver = harness.connector.driver("hv1", BackendKind::Libvirt);
        assert_eq!(driver.calls("create_volume"), 2);
        assert_eq!(report.backends["hv1"].volumes, vec!["r1.qcow2", "r1-day0.img"]);

        let disk = driver.volume("default", "r1.qcow2").unwrap();
        assert_eq!(disk.source, VolumeSource::Clone { base_image: "base.qcow2".to_string() });
        assert_eq!(disk.resize_gib, Some(8));

        let day0 = driver.volume("default", "r1-day0.img").unwrap();
        assert_eq!(day0.format, VolumeFormat::Raw);
        assert_eq!(day0.source, VolumeSource::Upload(b"hostname r1\nuser admin\n".to_vec()));
    }

    #[tokio::test]
    async fn test_undefine_deletes_existing_volumes() {
        let harness = harness();
        let run = harness.run();
        let ctx = run.context();
        let device = ctx.device(&ctx.topology.devices[0]).unwrap();
        let mut report = ActionReport::new(Action::Undefine);

        PoolVolumes.apply(&ctx, &device, Action::Undefine, &mut report).await.unwrap();
        let driver = harness.connector.driver("hv1", BackendKind::Libvirt);
        assert_eq!(driver.calls("delete_volume"), 0);

        PoolVolumes.apply(&ctx, &device, Action::Define, &mut report).await.unwrap();
        PoolVolumes.apply(&ctx, &device, Action::Undefine, &mut report).await.unwrap();
        assert_eq!(driver.calls("delete_volume"), 2);
        assert!(driver.volume("default", "r1.qcow2").is_none());
        assert!(driver.volume("default", "base.qcow2").is_some());
    }

    #[tokio::test]
    async fn test_power_actions_do_not_touch_volumes() {
        let harness = harness();
        let run = harness.run();
        let ctx = run.context();
        let device = ctx.device(&ctx.topology.devices[0]).unwrap();
        let mut report = ActionReport::new(Action::Create);

        for action in [Action::Create, Action::Shutdown, Action::Destroy] {
            PoolVolumes.apply(&ctx, &device, action, &mut report).await.unwrap();
        }
        assert_eq!(harness.connector.driver("hv1", BackendKind::Libvirt).calls("state"), 0);
    }
}
