//! Command-line surface: `dwarfs <image> <mountpoint> [options]`.

use std::path::PathBuf;

use clap::{CommandFactory, Parser};

use crate::Result;

pub mod daemon;
pub mod mount;
pub mod options;

pub use options::MountOptions;

#[derive(Parser, Debug)]
#[command(
    name = "dwarfs",
    version,
    about = "Mount a read-only DwarFS filesystem image."
)]
struct Cli {
    /// Path to the filesystem image.
    image: PathBuf,

    /// Empty directory to mount the image on.
    mountpoint: PathBuf,

    /// Mount options, comma-separated (see the option table in --help).
    #[arg(
        short = 'o',
        value_name = "opt[,opt...]",
        long_help = "Mount options:\n\
            \x20 cachesize=SIZE      set size of block cache (512M)\n\
            \x20 blocksize=SIZE      set file I/O block size (512K)\n\
            \x20 readahead=SIZE      set readahead size (0)\n\
            \x20 workers=NUM         number of worker threads (2)\n\
            \x20 mlock=NAME          mlock mode: (none), try, must\n\
            \x20 decratio=NUM        ratio for full decompression (0.8)\n\
            \x20 offset=NUM|auto     filesystem image offset in bytes (0)\n\
            \x20 enable_nlink        show correct hardlink numbers\n\
            \x20 readonly            show read-only file system\n\
            \x20 (no_)cache_image    (don't) keep image in kernel cache\n\
            \x20 (no_)cache_files    (don't) keep files in kernel cache\n\
            \x20 debuglevel=NAME     error, warn, info, debug, trace\n\
            \x20 tidy_strategy=NAME  (none)|time|swap\n\
            \x20 tidy_interval=TIME  interval for cache tidying (5m)\n\
            \x20 tidy_max_age=TIME   tidy blocks after this time (10m)\n\
            \x20 seq_detector=NUM    sequential access detector threshold (4)\n\
            \x20 perfmon=name[+...]  enable performance monitor\n\
            \x20 perfmon_trace=FILE  write performance monitor trace file"
    )]
    options: Vec<String>,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Run the event loop single-threaded.
    #[arg(short = 's', long)]
    single_thread: bool,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub image: PathBuf,
    pub mountpoint: PathBuf,
    pub opts: MountOptions,
    pub foreground: bool,
    pub single_thread: bool,
}

/// Parse CLI arguments into the internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let opts = MountOptions::parse(&cli.options)?;

    Ok(CliArgs {
        image: cli.image,
        mountpoint: cli.mountpoint,
        opts,
        foreground: cli.foreground,
        single_thread: cli.single_thread,
    })
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    mount::execute(args)
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
