//! Ownership transfer of the real device nodes, behind a trait so the
//! reservation engine can be exercised without touching `/dev`.

use crate::core::device_path;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use std::process::Command;
use tracing::{info, warn};

/// Mutations the engine performs on device nodes.
pub trait DeviceOps {
    /// Change the owner of `/dev/nvidia<minor_id>`. A failure here means the
    /// daemon lost the ability to enforce reservations and must not continue.
    fn set_node_owner(&mut self, minor_id: u32, uid: u32, gid: u32) -> anyhow::Result<()>;

    /// Kill every process still holding the node open. Best effort: invoked
    /// after a release because telemetry sometimes misses processes.
    fn kill_stragglers(&mut self, minor_id: u32);
}

/// Liveness probe for client processes.
pub trait ProcessProbe {
    fn alive(&self, pid: i32) -> bool;
}

/// Real device nodes under `/dev`.
#[derive(Debug, Default)]
pub struct DevNodes;

impl DeviceOps for DevNodes {
    fn set_node_owner(&mut self, minor_id: u32, uid: u32, gid: u32) -> anyhow::Result<()> {
        let path = device_path(minor_id);
        chown(
            &path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .map_err(|e| {
            anyhow::anyhow!(
                "could not set owner of {} to uid {}: {}",
                path.display(),
                uid,
                e
            )
        })
    }

    fn kill_stragglers(&mut self, minor_id: u32) {
        let path = device_path(minor_id);
        let output = match Command::new("fuser").arg(&path).output() {
            Ok(output) => output,
            Err(e) => {
                warn!("could not call fuser on {}: {}", path.display(), e);
                return;
            }
        };

        let own_pid = std::process::id() as i32;
        // fuser writes the pid list to stdout; access-mode suffixes such as
        // "1234m" land on stderr on most builds, so strip non-digits anyway.
        for token in String::from_utf8_lossy(&output.stdout).split_whitespace() {
            let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
            let Ok(pid) = digits.parse::<i32>() else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            info!("killing leftover process {} on {}", pid, path.display());
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("could not kill leftover process {}: {}", pid, e);
            }
        }
    }
}

/// Zero-signal probe against the live process table.
#[derive(Debug, Default)]
pub struct KillProbe;

impl ProcessProbe for KillProbe {
    fn alive(&self, pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }
}
