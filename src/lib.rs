use thiserror::Error;

pub mod cache;
pub mod cli;
pub mod fs;
pub mod image;
pub mod logging;
pub mod metadata;
pub mod perfmon;
pub mod reader;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("not a symlink")]
    NotSymlink,
    #[error("access denied")]
    AccessDenied,
    #[error("buffer too small")]
    Range,
    #[error("no such attribute")]
    NoAttr,
    #[error("operation not supported")]
    NotSupported,
    #[error("corrupt filesystem image: {0}")]
    CorruptImage(String),
    #[error("block decompression failed: {0}")]
    Decompress(String),
    #[error("cancelled")]
    Cancelled,
    #[error("filesystem is shutting down")]
    ShuttingDown,
    #[error("cli error: {0}")]
    Cli(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map a domain error to the errno reported at the protocol boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::NotDir => libc::ENOTDIR,
            Error::IsDir => libc::EISDIR,
            Error::NotSymlink => libc::EINVAL,
            Error::AccessDenied => libc::EACCES,
            Error::Range => libc::ERANGE,
            #[cfg(target_os = "macos")]
            Error::NoAttr => libc::ENOATTR,
            #[cfg(not(target_os = "macos"))]
            Error::NoAttr => libc::ENODATA,
            Error::NotSupported => libc::ENOTSUP,
            Error::CorruptImage(_)
            | Error::Decompress(_)
            | Error::Cancelled
            | Error::ShuttingDown => libc::EIO,
            Error::Cli(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Translate any error surfaced by a filesystem operation into an errno.
///
/// Known domain errors map per the taxonomy; anything else is logged at
/// error level and reported as EIO, so an internal failure never leaks
/// into the kernel protocol as something the kernel cannot handle.
pub fn errno_of(err: &anyhow::Error) -> i32 {
    if let Some(domain) = err.downcast_ref::<Error>() {
        domain.errno()
    } else if let Some(io) = err.downcast_ref::<std::io::Error>() {
        io.raw_os_error().unwrap_or(libc::EIO)
    } else {
        tracing::error!(error = %err, "unclassified filesystem error");
        libc::EIO
    }
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
