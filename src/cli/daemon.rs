//! Background-mount support.
//!
//! A daemonized mount forks before any thread exists; the worker detaches
//! and brings the filesystem up while the launcher blocks on a handshake
//! pipe for the mount outcome, so the foreground exit code reflects
//! whether the image actually mounted.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};

const TAG_MOUNTED: u8 = 0;
const TAG_FAILED: u8 = 1;

/// Outcome of the worker's bring-up, reported over the handshake pipe.
/// A failure carries the mount error text so the launcher can print it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountStatus {
    Mounted,
    Failed(String),
}

pub enum ForkOutcome {
    Launcher(LauncherEnd),
    Worker(WorkerEnd),
}

/// Launcher side of the handshake: waits for the worker's report.
pub struct LauncherEnd {
    pipe: File,
}

/// Worker side: detaches from the session, then reports exactly once.
pub struct WorkerEnd {
    pipe: File,
}

fn handshake_pair() -> io::Result<(LauncherEnd, WorkerEnd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // Each end owns its fd as a File; dropping an end closes it.
    Ok((
        LauncherEnd {
            pipe: unsafe { File::from_raw_fd(fds[0]) },
        },
        WorkerEnd {
            pipe: unsafe { File::from_raw_fd(fds[1]) },
        },
    ))
}

/// Fork the mount worker. The caller matches on the outcome: the launcher
/// waits, the worker detaches and mounts.
pub fn fork_with_handshake() -> io::Result<ForkOutcome> {
    let (launcher, worker) = handshake_pair()?;
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            drop(launcher);
            Ok(ForkOutcome::Worker(worker))
        }
        _pid => {
            drop(worker);
            Ok(ForkOutcome::Launcher(launcher))
        }
    }
}

impl LauncherEnd {
    /// Block until the worker reports. A worker that dies before
    /// reporting reads as a failure, never as success.
    pub fn wait(mut self) -> io::Result<MountStatus> {
        let mut buf = Vec::new();
        self.pipe.read_to_end(&mut buf)?;
        Ok(match buf.split_first() {
            Some((&TAG_MOUNTED, _)) => MountStatus::Mounted,
            Some((&TAG_FAILED, reason)) => {
                MountStatus::Failed(String::from_utf8_lossy(reason).into_owned())
            }
            _ => MountStatus::Failed("worker exited before reporting".to_string()),
        })
    }
}

impl WorkerEnd {
    /// Detach the worker: new session, SIGHUP ignored (logout must not
    /// take the mount down), stdio on /dev/null. The handshake pipe stays
    /// open for the report.
    pub fn detach(&self) -> io::Result<()> {
        if unsafe { libc::setsid() } < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
        }

        let devnull = File::options().read(true).write(true).open("/dev/null")?;
        for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Report the mount outcome and close the pipe (consumes the end, so
    /// a worker cannot report twice).
    pub fn report(mut self, status: &MountStatus) -> io::Result<()> {
        match status {
            MountStatus::Mounted => self.pipe.write_all(&[TAG_MOUNTED]),
            MountStatus::Failed(reason) => {
                self.pipe.write_all(&[TAG_FAILED])?;
                self.pipe.write_all(reason.as_bytes())
            }
        }
    }
}
