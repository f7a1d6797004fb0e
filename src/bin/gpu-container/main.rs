//! Set-uid helper that runs a user command inside a private view of `/dev`.
//!
//! The masking works through an overlay mount: for every device name given
//! on the command line a whiteout node (character device 0:0) is created in
//! the upper layer, and an overlay of the real `/dev` with that upper layer
//! makes the names vanish from the merged view. A bind mount or symlink
//! would not survive programs that stat the directory; the whiteout is
//! enforced by the kernel. The command additionally gets its own PID
//! namespace so it cannot see or signal other tenants' processes.
//!
//! Process tree: the outer process (still in the host PID namespace) forks a
//! child that becomes PID 1 inside the namespace, remounts /proc, drops
//! privileges and forks the grandchild that execs the user command. PID 1
//! reaps orphans; outer and middle both forward SIGINT down one level.

use anyhow::{bail, Context, Result};
use gpuclaim::utils::parse_environ;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, getppid, getuid, setresuid, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::exit;
use std::sync::atomic::{AtomicI32, Ordering};

const SCRATCH: &str = "/tmp/gpu-container";

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

fn usage() {
    eprintln!("Usage: gpu-container <device file names...> -- <command> [args]");
    eprintln!();
    eprintln!("Hides the named /dev entries from the command and runs it in its own PID namespace.");
}

fn main() {
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    if args.len() < 2 || args[0] == "-h" || args[0] == "--help" {
        usage();
        exit(1);
    }
    let Some(sep) = args.iter().position(|a| *a == "--") else {
        usage();
        exit(1);
    };
    if sep == args.len() - 1 {
        usage();
        exit(1);
    }

    let devices = args[..sep].to_vec();
    let command = args[sep + 1..].to_vec();

    if let Err(e) = run(devices, command) {
        eprintln!("gpu-container: {e:#}");
        exit(1);
    }
}

fn run(devices: Vec<OsString>, command: Vec<OsString>) -> Result<()> {
    for dev in &devices {
        validate_device_name(dev)?;
    }

    // Die with the invoking front-end rather than lingering as an orphan.
    prctl::set_pdeathsig(Signal::SIGTERM).context("could not set parent-death signal")?;

    // Capture the parent's environment before entering any namespace: the
    // dynamic loader already stripped ours because this binary is set-uid,
    // and the user's command must still see the original variables.
    let parent_env = parse_environ(
        &fs::read(format!("/proc/{}/environ", getppid()))
            .context("could not read parent environment")?,
    );

    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID)
        .context("could not create mount and PID namespaces")?;

    build_dev_overlay(&devices)?;

    match unsafe { fork() }.context("could not fork")? {
        ForkResult::Child => init_process(command, parent_env),
        ForkResult::Parent { child } => {
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            install_sigint_forwarder()?;
            drop_privileges()?;
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => exit(code),
                Ok(_) | Err(_) => exit(1),
            }
        }
    }
}

/// Mount work, still with full privileges: everything here is scoped to the
/// new mount namespace and cannot leak back to the host.
fn build_dev_overlay(devices: &[OsString]) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("could not make mounts private")?;

    let scratch = Path::new(SCRATCH);
    fs::create_dir_all(scratch).context("could not create scratch directory")?;
    mount(
        Some("none"),
        scratch,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .context("could not mount scratch tmpfs")?;

    let workdir = scratch.join("workdir");
    let upper = scratch.join("upper");
    let pts_save = scratch.join("pts");
    for dir in [&workdir, &upper, &pts_save] {
        fs::DirBuilder::new()
            .mode(0o755)
            .create(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    for dev in devices {
        let path = upper.join(dev);
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(0, 0),
        )
        .with_context(|| format!("could not create whiteout for {dev:?}"))?;
    }

    // Terminal devices are opened through /dev/pts; park the mount while the
    // overlay goes on and put it back on top afterwards.
    mount(
        Some("/dev/pts"),
        pts_save.as_path(),
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .context("could not move /dev/pts aside")?;

    let data = format!(
        "lowerdir=/dev,upperdir={},workdir={}",
        upper.display(),
        workdir.display()
    );
    mount(
        Some("overlay"),
        "/dev",
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .context("could not create /dev overlay")?;

    mount(
        Some(pts_save.as_path()),
        "/dev/pts",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .context("could not move /dev/pts back")?;

    mount(
        Some("none"),
        "/dev/shm",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .context("could not mount /dev/shm tmpfs")?;

    Ok(())
}

/// PID 1 of the new namespace.
fn init_process(command: Vec<OsString>, parent_env: HashMap<OsString, OsString>) -> ! {
    let setup = (|| -> Result<()> {
        // Fresh /proc so process listings reflect this namespace only.
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .context("could not remount /proc")?;
        drop_privileges()
    })();
    if let Err(e) = setup {
        eprintln!("gpu-container: {e:#}");
        exit(1);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_command(command, parent_env),
        Ok(ForkResult::Parent { child }) => {
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            if install_sigint_forwarder().is_err() {
                exit(1);
            }
            // As PID 1 we inherit every orphan in the namespace; keep
            // reaping until the command itself is done.
            loop {
                match waitpid(Pid::from_raw(-1), None) {
                    Ok(status) if status.pid() == Some(child) => exit(0),
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(_) => exit(0),
                }
            }
        }
        Err(e) => {
            eprintln!("gpu-container: could not fork: {e}");
            exit(1);
        }
    }
}

fn exec_command(command: Vec<OsString>, parent_env: HashMap<OsString, OsString>) -> ! {
    // Hand back what the loader stripped, without clobbering anything the
    // front-end set on purpose (CUDA_VISIBLE_DEVICES in particular).
    for (key, value) in parent_env {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }

    let argv: Result<Vec<CString>, _> = command
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect();
    let argv = match argv {
        Ok(argv) => argv,
        Err(_) => {
            eprintln!("gpu-container: command contains a NUL byte");
            exit(1);
        }
    };

    match execvp(&argv[0], &argv) {
        Err(e) => {
            eprintln!("gpu-container: could not execvp {:?}: {}", command[0], e);
            exit(127);
        }
        Ok(infallible) => match infallible {},
    }
}

fn drop_privileges() -> Result<()> {
    let uid = getuid();
    setresuid(uid, uid, uid).context("could not drop privileges")
}

fn validate_device_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') || matches!(bytes, b"." | b"..") {
        bail!("invalid device name {name:?}");
    }
    Ok(())
}

extern "C" fn forward_sigint(_signo: nix::libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
    }
}

fn install_sigint_forwarder() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(forward_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.context("could not install signal handler")?;
    Ok(())
}
