//! Mount option grammar: the `-o key[=value]` surface and its unit
//! parsers.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{TidyConfig, TidyStrategy};
use crate::image::{section::ImageOffset, MlockMode};
use crate::logging::LogLevel;
use crate::{Error, Result};

pub const DEFAULT_CACHE_SIZE: usize = 512 << 20;
pub const DEFAULT_BLOCK_SIZE: usize = 512 << 10;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_DECOMPRESS_RATIO: f64 = 0.8;
pub const DEFAULT_SEQ_DETECTOR_THRESHOLD: usize = 4;

/// Parsed `-o` options with their documented defaults applied.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub cachesize: usize,
    pub blocksize: usize,
    pub readahead: u64,
    pub workers: usize,
    pub mlock: MlockMode,
    pub decratio: f64,
    pub image_offset: ImageOffset,
    pub enable_nlink: bool,
    pub readonly: bool,
    pub cache_image: bool,
    pub cache_files: bool,
    pub debuglevel: Option<LogLevel>,
    pub tidy: TidyConfig,
    pub seq_detector: usize,
    pub perfmon: Vec<String>,
    pub perfmon_trace: Option<PathBuf>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cachesize: DEFAULT_CACHE_SIZE,
            blocksize: DEFAULT_BLOCK_SIZE,
            readahead: 0,
            workers: DEFAULT_WORKERS,
            mlock: MlockMode::None,
            decratio: DEFAULT_DECOMPRESS_RATIO,
            image_offset: ImageOffset::default(),
            enable_nlink: false,
            readonly: false,
            cache_image: false,
            cache_files: true,
            debuglevel: None,
            tidy: TidyConfig::default(),
            seq_detector: DEFAULT_SEQ_DETECTOR_THRESHOLD,
            perfmon: Vec::new(),
            perfmon_trace: None,
        }
    }
}

impl MountOptions {
    /// Parse repeated `-o` argument values (each possibly comma-separated).
    pub fn parse<I, S>(raw: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = Self::default();

        for group in raw {
            for opt in group.as_ref().split(',').filter(|o| !o.is_empty()) {
                let (key, value) = match opt.split_once('=') {
                    Some((k, v)) => (k, Some(v)),
                    None => (opt, None),
                };

                match key {
                    "cachesize" => opts.cachesize = parse_size_with_unit(required(key, value)?)? as usize,
                    "blocksize" => opts.blocksize = parse_size_with_unit(required(key, value)?)? as usize,
                    "readahead" => opts.readahead = parse_size_with_unit(required(key, value)?)?,
                    "workers" => {
                        opts.workers = required(key, value)?
                            .parse()
                            .map_err(|_| Error::Cli(format!("invalid workers: {opt}")))?;
                        if opts.workers == 0 {
                            return Err(Error::Cli("workers must be at least 1".into()).into());
                        }
                    }
                    "mlock" => opts.mlock = required(key, value)?.parse()?,
                    "decratio" => {
                        opts.decratio = required(key, value)?
                            .parse()
                            .map_err(|_| Error::Cli(format!("invalid decratio: {opt}")))?;
                    }
                    "offset" => opts.image_offset = required(key, value)?.parse()?,
                    "enable_nlink" => opts.enable_nlink = true,
                    "readonly" => opts.readonly = true,
                    "cache_image" => opts.cache_image = true,
                    "no_cache_image" => opts.cache_image = false,
                    "cache_files" => opts.cache_files = true,
                    "no_cache_files" => opts.cache_files = false,
                    "debuglevel" => opts.debuglevel = Some(required(key, value)?.parse()?),
                    "tidy_strategy" => opts.tidy.strategy = required(key, value)?.parse()?,
                    "tidy_interval" => opts.tidy.interval = parse_time_with_unit(required(key, value)?)?,
                    "tidy_max_age" => opts.tidy.max_age = parse_time_with_unit(required(key, value)?)?,
                    "seq_detector" => {
                        opts.seq_detector = required(key, value)?
                            .parse()
                            .map_err(|_| Error::Cli(format!("invalid seq_detector: {opt}")))?;
                    }
                    "perfmon" => {
                        opts.perfmon = required(key, value)?
                            .split('+')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                    "perfmon_trace" => {
                        opts.perfmon_trace = Some(PathBuf::from(required(key, value)?));
                    }
                    other => {
                        return Err(Error::Cli(format!("unknown option: {other}")).into());
                    }
                }
            }
        }

        if !(0.0..=1.0).contains(&opts.decratio) {
            return Err(Error::Cli("decratio must be between 0.0 and 1.0".into()).into());
        }
        if opts.tidy.strategy != TidyStrategy::None && opts.tidy.interval.is_zero() {
            return Err(Error::Cli("tidy_interval must be positive".into()).into());
        }

        Ok(opts)
    }
}

fn required<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.ok_or_else(|| Error::Cli(format!("option {key} requires a value")).into())
}

/// Parse a size: decimal integer with an optional 1024-based K/M/G suffix.
pub fn parse_size_with_unit(s: &str) -> Result<u64> {
    let (digits, shift) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 10),
        Some('m') | Some('M') => (&s[..s.len() - 1], 20),
        Some('g') | Some('G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| Error::Cli(format!("invalid size: {s}")))?;
    base.checked_mul(1u64 << shift)
        .ok_or_else(|| Error::Cli(format!("size overflows: {s}")).into())
}

/// Parse a duration: decimal integer with ms/s/m/h/d suffix (bare numbers
/// are seconds).
pub fn parse_time_with_unit(s: &str) -> Result<Duration> {
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(d) = s.strip_suffix("ms") {
        (d, Duration::from_millis)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, Duration::from_secs)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, |v| Duration::from_secs(v * 60))
    } else if let Some(d) = s.strip_suffix('h') {
        (d, |v| Duration::from_secs(v * 3600))
    } else if let Some(d) = s.strip_suffix('d') {
        (d, |v| Duration::from_secs(v * 86400))
    } else {
        (s, Duration::from_secs)
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Cli(format!("invalid duration: {s}")))?;
    Ok(unit(value))
}
