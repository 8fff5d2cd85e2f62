//! Mount orchestration: bring-up, daemonization, signal handling and
//! teardown.

use std::{fs, path::Path, sync::mpsc, sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::cli::{daemon, CliArgs};
use crate::fs::{fuse, DwarFs, MountSession};
use crate::logging;
use crate::{Error, Result};

#[derive(Debug)]
enum Event {
    Signal,
    Unmounted,
}

pub struct MountContext {
    pub session: MountSession,
    pub fs: Arc<DwarFs>,
    pub fuse_handle: Option<fuse::MountHandle>,
}

/// Execute the mount and hold it until a termination signal is received
/// or the target is unmounted externally.
pub fn execute(args: CliArgs) -> Result<()> {
    logging::init_logging(args.opts.debuglevel, args.foreground)?;

    if args.single_thread {
        debug!("single-threaded event loop requested");
    }

    if args.foreground {
        let ctx = mount(&args)?;
        return wait_for_shutdown(ctx);
    }

    run_daemonized(args)
}

/// Fork a worker and hand the mount off to it. The launcher blocks on
/// the handshake until the worker reports, so the exit code reflects the
/// actual mount outcome.
fn run_daemonized(args: CliArgs) -> Result<()> {
    match daemon::fork_with_handshake()? {
        daemon::ForkOutcome::Launcher(launcher) => match launcher.wait()? {
            daemon::MountStatus::Mounted => Ok(()),
            daemon::MountStatus::Failed(reason) => {
                Err(Error::Cli(format!("mount failed in background worker: {reason}")).into())
            }
        },
        daemon::ForkOutcome::Worker(worker) => {
            // Detach before bring-up so every thread (FUSE session, cache
            // workers, tidy loop) is created post-fork.
            worker.detach()?;

            match mount(&args) {
                Ok(ctx) => {
                    worker.report(&daemon::MountStatus::Mounted)?;
                    wait_for_shutdown(ctx)
                }
                Err(e) => {
                    let _ = worker.report(&daemon::MountStatus::Failed(e.to_string()));
                    Err(e)
                }
            }
        }
    }
}

/// Bring up the full stack and spawn the FUSE session.
pub fn mount(args: &CliArgs) -> Result<MountContext> {
    validate_mountpoint(&args.mountpoint)?;

    let fs = Arc::new(DwarFs::open(&args.image, &args.opts)?);
    let mut session = MountSession::new(&args.image, &args.mountpoint);

    let handle = fuse::spawn(Arc::clone(&fs), &args.mountpoint)?;
    session.mark_ready();
    info!(
        mount_id = %session.mount_id,
        image = %args.image.display(),
        mountpoint = %args.mountpoint.display(),
        "mount ready"
    );

    Ok(MountContext {
        session,
        fs,
        fuse_handle: Some(handle),
    })
}

fn validate_mountpoint(path: &Path) -> Result<()> {
    if !path.is_dir() {
        return Err(Error::Cli(format!(
            "mountpoint is not a directory: {}",
            path.display()
        ))
        .into());
    }
    Ok(())
}

/// Block until ctrl-c or an external unmount, then tear down in reverse
/// order of setup.
fn wait_for_shutdown(mut ctx: MountContext) -> Result<()> {
    let Some(handle) = ctx.fuse_handle.take() else {
        return Ok(());
    };

    info!("dwarfs mount active; press Ctrl+C to unmount");

    let (tx, rx) = mpsc::channel();

    ctrlc::set_handler({
        let tx = tx.clone();
        move || {
            let _ = tx.send(Event::Signal);
        }
    })
    .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;

    // Watch for external unmounts.
    let mount_path = ctx.session.mountpoint.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(500));
        if !is_mounted(&mount_path) {
            let _ = tx.send(Event::Unmounted);
            break;
        }
    });

    match rx.recv() {
        Ok(Event::Signal) => {
            info!("signal received; unmounting {}", ctx.session.mountpoint.display());
        }
        Ok(Event::Unmounted) => {
            info!(
                "detected external unmount; exiting for {}",
                ctx.session.mountpoint.display()
            );
        }
        Err(_) => {}
    }
    handle.unmount();

    ctx.fs.shutdown();
    ctx.session.mark_unmounted();

    if let Some(perfmon) = ctx.fs.perfmon() {
        eprint!("{}", perfmon.summarize());
    }

    Ok(())
}

/// Check if a path is currently mounted (Linux-only, /proc/mounts).
fn is_mounted(path: &Path) -> bool {
    if let Ok(contents) = fs::read_to_string("/proc/mounts") {
        let target = path.to_string_lossy();
        return contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|p| p == target);
    }
    false
}
