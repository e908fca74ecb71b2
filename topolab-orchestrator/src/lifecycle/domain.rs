//! Domain controllers: libvirt VMs, containers and remote simulations.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use topolab_virt::{
    ContainerOptions, DiskAttachment, DiskDevice, DomainDefinition, PowerAction, ResourceRef, ResourceState,
    SimulationOptions, VolumeFormat,
};

use super::{
    action_allowed, action_settled, live_state, Action, ActionReport, Controllers, DeviceContext, DomainController,
    RunContext,
};
use crate::cache::{BackendKind, Connection};
use crate::error::Result;
use crate::model::BaseImageType;
use crate::names;
use crate::plan::{xr_environment, Planner};
use crate::store::{InterfacePatch, TopologyChange};
use crate::template::Variables;

/// Run a domain action and its management-plane and store follow-ups.
///
/// A managed device is onboarded after its domain is defined. After an
/// undefine the management and data interface records are cleared and
/// the device is removed from the management plane.
///
/// Returns whether the domain ended up where `action` leads: either the
/// controller acted, or the live state already matched. A `false` means
/// the action was refused and no status may be recorded for it.
pub async fn domain_action(
    ctx: &RunContext<'_>,
    controllers: &Controllers,
    device: &DeviceContext<'_>,
    action: Action,
    report: &mut ActionReport,
) -> Result<bool> {
    let controller = controllers.domains(device.profile.backend)?;
    let acted = controller.apply(ctx, device, action, report).await?;
    if !acted {
        return controller.settled(ctx, device, action).await;
    }

    match action {
        Action::Define if device.is_managed() => {
            ctx.manager.onboard(&ctx.topology.name, device.device, device.definition).await?;
        }
        Action::Undefine => {
            ctx.write(TopologyChange::ClearManagement { device: device.name().to_string() }).await?;
            let id = device.device.id;
            for iface in 0..ctx.resolver.num_interfaces() {
                if let Some(slot) = ctx.resolver.iface_slot(id, iface) {
                    ctx.write(TopologyChange::ClearInterface { slot: slot.clone() }).await?;
                }
            }
            if device.is_managed() {
                ctx.manager.remove(device.name()).await?;
            }
        }
        _ => {}
    }
    Ok(true)
}

/// Apply a plain power transition when the live state allows it.
async fn power(
    connection: &Connection,
    device: &DeviceContext<'_>,
    state: ResourceState,
    action: Action,
    report: &mut ActionReport,
) -> Result<bool> {
    let Some(power) = action.power() else {
        return Ok(false);
    };
    if !action_allowed(state, action) {
        debug!(state = ?state, "Domain action not applicable");
        return Ok(false);
    }
    connection.driver.apply(&ResourceRef::domain(device.name()), power).await?;
    report.domain(&device.hypervisor.name, device.name());
    info!("Domain {}", action);
    Ok(true)
}

// =============================================================================
// VIRTUAL MACHINES
// =============================================================================

pub struct VmDomains;

impl VmDomains {
    fn definition(ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<(DomainDefinition, Vec<TopologyChange>)> {
        let plan = Planner::new(ctx.resolver, device.allocator).vm(device.device, device.profile)?;
        let def = device.definition;

        let mut domain = DomainDefinition::new(device.name(), device.device.id, plan.management.attachment())
            .with_template(&def.template)
            .with_resources(def.vcpus, def.memory);

        if let Some(base_image) = &def.base_image {
            domain = domain.with_disk(DiskAttachment {
                pool: def.storage_pool.clone(),
                volume: names::volume_name(device.name()),
                device: DiskDevice::Disk,
                format: VolumeFormat::Qcow2,
                target: "vda".to_string(),
                bus: "virtio".to_string(),
                backing_store: (def.base_image_type == BaseImageType::BackingStore).then(|| base_image.clone()),
            });
        }
        if def.day0_file.is_some() {
            let (disk, target, bus) = device.profile.day0_attachment.placement();
            domain = domain.with_disk(DiskAttachment {
                pool: def.storage_pool.clone(),
                volume: names::day0_volume_name(device.name()),
                device: disk,
                format: VolumeFormat::Raw,
                target: target.to_string(),
                bus: bus.to_string(),
                backing_store: None,
            });
        }

        domain.extra_management = plan.extra_management.iter().map(|i| i.attachment()).collect();
        domain.interfaces = plan.data.iter().map(|i| i.attachment()).collect();
        Ok((domain, plan.write_backs()))
    }
}

#[async_trait]
impl DomainController for VmDomains {
    #[instrument(skip(self, ctx, device, report), fields(device = %device.name(), hypervisor = %device.hypervisor.name, action = %action))]
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<bool> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Libvirt).await?;
        let state = live_state(&connection, &ResourceRef::domain(device.name())).await?;

        match action {
            Action::Define => {
                if !action_allowed(state, action) {
                    return Ok(false);
                }
                let (domain, write_backs) = Self::definition(ctx, device)?;
                connection.driver.define_domain(&domain).await?;
                ctx.write_all(write_backs).await?;
                report.domain(&device.hypervisor.name, device.name());
                info!(interfaces = domain.interfaces.len(), "Defined domain");
                Ok(true)
            }
            Action::Update => Ok(false),
            _ => power(&connection, device, state, action, report).await,
        }
    }

    async fn state(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<ResourceState> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Libvirt).await?;
        live_state(&connection, &ResourceRef::domain(device.name())).await
    }
}

// =============================================================================
// CONTAINERS
// =============================================================================

pub struct ContainerDomains;

impl ContainerDomains {
    fn definition(ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<(DomainDefinition, Vec<TopologyChange>)> {
        let (plan, mgmt_name) = Planner::new(ctx.resolver, device.allocator).container(device.device, device.profile)?;
        let def = device.definition;
        let profile = device.profile.container.clone().unwrap_or_default();

        let options = ContainerOptions {
            environment: if profile.xr_environment {
                xr_environment(&plan, &mgmt_name)
            } else {
                Vec::new()
            },
            capabilities: profile.capabilities.iter().map(|c| c.to_string()).collect(),
            devices: profile.devices.iter().map(|d| d.to_string()).collect(),
            command: profile.command.map(str::to_string),
            privileged: profile.privileged,
            management_subnet: device.allocator.mgmt_subnet().ok(),
            config_mount: def.day0_file.as_ref().map(|_| {
                (
                    format!("{}/{}", device.hypervisor.images_dir, names::day0_volume_name(device.name())),
                    profile.config_target.to_string(),
                )
            }),
            post_start: profile.post_start.clone(),
        };

        let image = def.base_image.clone().unwrap_or_else(|| def.template.clone());
        let mut domain = DomainDefinition::new(device.name(), device.device.id, plan.management.attachment())
            .with_template(image)
            .with_resources(def.vcpus, def.memory);
        domain.interfaces = plan.data.iter().map(|i| i.attachment()).collect();
        domain.container = Some(options);
        Ok((domain, plan.write_backs()))
    }
}

#[async_trait]
impl DomainController for ContainerDomains {
    #[instrument(skip(self, ctx, device, report), fields(device = %device.name(), hypervisor = %device.hypervisor.name, action = %action))]
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<bool> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Container).await?;
        let state = live_state(&connection, &ResourceRef::domain(device.name())).await?;

        match action {
            Action::Define => {
                if !action_allowed(state, action) {
                    return Ok(false);
                }
                let (domain, write_backs) = Self::definition(ctx, device)?;
                connection.driver.define_domain(&domain).await?;
                ctx.write_all(write_backs).await?;
                report.domain(&device.hypervisor.name, device.name());
                info!(image = %domain.template, "Defined container");
                Ok(true)
            }
            Action::Create => {
                if !power(&connection, device, state, action, report).await? {
                    return Ok(false);
                }
                let commands = device.profile.container.as_ref().map(|c| c.post_start.as_slice()).unwrap_or(&[]);
                for command in commands {
                    debug!(command = %command, "Running post-start command");
                    connection.driver.exec(device.name(), command).await?;
                }
                Ok(true)
            }
            Action::Update => Ok(false),
            _ => power(&connection, device, state, action, report).await,
        }
    }

    async fn state(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<ResourceState> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Container).await?;
        live_state(&connection, &ResourceRef::domain(device.name())).await
    }
}

// =============================================================================
// SIMULATIONS
// =============================================================================

/// Devices run by a remote simulator. The simulator has no defined state:
/// the configuration is built and pushed when the simulation starts, and
/// stopping it tears everything down.
pub struct SimulationDomains;

impl SimulationDomains {
    async fn start(
        &self,
        ctx: &RunContext<'_>,
        connection: &Connection,
        device: &DeviceContext<'_>,
        report: &mut ActionReport,
    ) -> Result<()> {
        let id = device.device.id;
        let def = device.definition;
        let plan = Planner::new(ctx.resolver, device.allocator).simulation(device.device, device.profile)?;
        let profile = device.profile.simulation.clone();

        let mut variables = Variables::new();
        variables.insert("id".to_string(), format!("{:02}", id));
        variables.insert("device-name".to_string(), device.name().to_string());
        variables.insert("host".to_string(), device.hypervisor.host.clone().unwrap_or_default());
        variables.insert("host-username".to_string(), device.hypervisor.username.clone().unwrap_or_default());
        variables.insert("cvac".to_string(), names::day0_volume_name(device.name()));
        let device_config = ctx.renderer.render(&format!("{}.json", def.template), &variables).await?;

        let mut domain = DomainDefinition::new(device.name(), id, plan.management.attachment())
            .with_template(&def.template)
            .with_resources(def.vcpus, def.memory);
        domain.interfaces = plan.data.iter().map(|i| i.attachment()).collect();
        domain.simulation = Some(SimulationOptions {
            interface_prefix: profile.as_ref().map(|p| p.interface_prefix.to_string()).unwrap_or_default(),
            management_interface: profile.as_ref().map(|p| p.management_interface.to_string()).unwrap_or_default(),
            device_config: Some(device_config),
        });

        connection.driver.define_domain(&domain).await?;
        ctx.write_all(plan.write_backs()).await?;
        connection.driver.apply(&ResourceRef::domain(device.name()), PowerAction::Create).await?;
        report.domain(&device.hypervisor.name, device.name());
        info!(interfaces = domain.interfaces.len(), "Started simulation");

        match connection.driver.host_interfaces(device.name()).await {
            Ok(taps) => {
                for (iface, tap) in taps {
                    if let Some(slot) = ctx.resolver.iface_slot(id, iface) {
                        ctx.write(TopologyChange::Interface {
                            slot: slot.clone(),
                            patch: InterfacePatch {
                                id: Some(iface),
                                host_interface: Some(tap),
                                ..Default::default()
                            },
                        })
                        .await?;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not read simulation taps"),
        }
        Ok(())
    }
}

#[async_trait]
impl DomainController for SimulationDomains {
    #[instrument(skip(self, ctx, device, report), fields(device = %device.name(), hypervisor = %device.hypervisor.name, action = %action))]
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<bool> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Simulation).await?;

        match action {
            Action::Define => {
                let plan = Planner::new(ctx.resolver, device.allocator).simulation(device.device, device.profile)?;
                ctx.write(TopologyChange::Management {
                    device: device.name().to_string(),
                    patch: plan.management_patch,
                })
                .await?;
                Ok(true)
            }
            Action::Create => {
                let state = live_state(&connection, &ResourceRef::domain(device.name())).await?;
                if state.is_active() {
                    return Ok(false);
                }
                self.start(ctx, &connection, device, report).await?;
                Ok(true)
            }
            Action::Shutdown => {
                let state = live_state(&connection, &ResourceRef::domain(device.name())).await?;
                power(&connection, device, state, action, report).await
            }
            Action::Destroy | Action::Update => Ok(false),
            // Nothing to tear down, but records stay while the simulation runs
            Action::Undefine => {
                let state = live_state(&connection, &ResourceRef::domain(device.name())).await?;
                Ok(!state.is_active())
            }
        }
    }

    async fn state(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<ResourceState> {
        let connection = ctx.connection(&device.hypervisor.name, BackendKind::Simulation).await?;
        live_state(&connection, &ResourceRef::domain(device.name())).await
    }

    async fn settled(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>, action: Action) -> Result<bool> {
        match action {
            Action::Destroy | Action::Update => Ok(true),
            _ => Ok(action_settled(self.state(ctx, device).await?, action)),
        }
    }
}
