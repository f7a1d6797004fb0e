//! NVML-backed telemetry.
//!
//! Two quirks of the NVIDIA stack shape this module. First, NVML init resets
//! the owner and permissions of every `/dev/nvidia*` node, so the owners are
//! snapshotted before init and restored afterwards. Second, the driver
//! occasionally re-widens the node mode bits, so every refresh narrows them
//! back to owner-only read/write.

use super::Provider;
use crate::core::{device_path, RESERVED_GROUP_GID};
use crate::protocol::{Card, GpuProcess};
use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;
use nvml_wrapper::Nvml;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use tracing::warn;

#[derive(Default)]
pub struct NvmlProvider {
    nvml: Option<Nvml>,
}

impl NvmlProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn nvml(&self) -> Result<&Nvml> {
        self.nvml.as_ref().context("telemetry is not initialized")
    }
}

/// Owner uids of `/dev/nvidia0..`, indexed by minor number, up to the first
/// missing node.
fn snapshot_node_owners() -> Vec<u32> {
    let mut owners = Vec::new();
    for minor_id in 0.. {
        match fs::metadata(device_path(minor_id)) {
            Ok(meta) => owners.push(meta.uid()),
            Err(_) => break,
        }
    }
    owners
}

fn merge_process(processes: &mut Vec<GpuProcess>, info: ProcessInfo) {
    let memory = match info.used_gpu_memory {
        UsedGpuMemory::Used(bytes) => bytes,
        UsedGpuMemory::Unavailable => 0,
    };
    if let Some(existing) = processes.iter_mut().find(|p| p.pid == info.pid) {
        existing.memory += memory;
        return;
    }
    // The uid comes from the /proc entry; a process that exited between the
    // NVML sample and now is simply dropped.
    let Ok(meta) = fs::metadata(format!("/proc/{}", info.pid)) else {
        return;
    };
    processes.push(GpuProcess {
        pid: info.pid,
        uid: meta.uid(),
        memory,
    });
}

impl Provider for NvmlProvider {
    fn init(&mut self) -> Result<Vec<Card>> {
        let owners = snapshot_node_owners();

        let nvml = Nvml::init().context("could not initialize NVML")?;
        let device_count = nvml
            .device_count()
            .context("could not list nvidia devices")?;

        let now_ms = crate::utils::monotonic_ms();
        let mut cards = Vec::with_capacity(device_count as usize);
        for index in 0..device_count {
            let device = nvml
                .device_by_index(index)
                .with_context(|| format!("could not get device {index}"))?;
            let minor_id = device
                .minor_number()
                .with_context(|| format!("could not query minor number of device {index}"))?;
            let card = Card {
                index,
                minor_id,
                name: device
                    .name()
                    .with_context(|| format!("could not get name of device {index}"))?,
                uuid: device
                    .uuid()
                    .with_context(|| format!("could not get uuid of device {index}"))?,
                memory_total: device
                    .memory_info()
                    .with_context(|| format!("could not get memory info of device {index}"))?
                    .total,
                last_usage_ms: now_ms,
                ..Card::default()
            };

            // NVML init just clobbered the node ownership; put back what was
            // there before so running reservations survive a daemon restart.
            if let Some(&uid) = owners.get(minor_id as usize) {
                if let Err(e) = chown(
                    &device_path(minor_id),
                    Some(Uid::from_raw(uid)),
                    Some(Gid::from_raw(RESERVED_GROUP_GID)),
                ) {
                    warn!(
                        "could not restore owner of {}: {}",
                        device_path(minor_id).display(),
                        e
                    );
                }
            }

            cards.push(card);
        }

        self.nvml = Some(nvml);
        Ok(cards)
    }

    fn refresh(&mut self, card: &mut Card, now_ms: u64) -> Result<()> {
        let device = self
            .nvml()?
            .device_by_index(card.index)
            .with_context(|| format!("could not get device {}", card.index))?;

        let memory = device.memory_info().context("could not get memory info")?;
        card.memory_total = memory.total;
        card.memory_used = memory.used;
        card.compute_percent = device
            .utilization_rates()
            .context("could not get utilization")?
            .gpu as u8;
        card.temperature_c = device
            .temperature(TemperatureSensor::Gpu)
            .context("could not get temperature")?;
        card.minor_id = device
            .minor_number()
            .context("could not query minor number")?;

        let path = device_path(card.minor_id);
        let meta = fs::metadata(&path)
            .with_context(|| format!("could not query owner of {}", path.display()))?;
        card.reserved_by_uid = meta.uid();

        // The driver sometimes re-opens the node to group/world; narrow it
        // back so only the owner can reach the card.
        if meta.mode() & 0o066 != 0 {
            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o600)) {
                warn!("could not set mode of {}: {}", path.display(), e);
            }
        }

        card.processes.clear();
        match device.running_compute_processes() {
            Ok(infos) => {
                for info in infos {
                    merge_process(&mut card.processes, info);
                }
            }
            Err(e) => warn!("could not get compute processes of card {}: {}", card.index, e),
        }
        match device.running_graphics_processes() {
            Ok(infos) => {
                for info in infos {
                    merge_process(&mut card.processes, info);
                }
            }
            Err(e) => warn!(
                "could not get graphics processes of card {}: {}",
                card.index, e
            ),
        }

        if !card.processes.is_empty() {
            card.last_usage_ms = now_ms;
        }
        card.locked_until_update = false;
        Ok(())
    }

    fn shutdown(&mut self) {
        // Dropping the handle runs nvmlShutdown.
        self.nvml.take();
    }
}
