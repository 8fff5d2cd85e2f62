//! Performance monitor: named-scope operation timers.
//!
//! Scopes are opt-in via `perfmon=name[+name...]`; a disabled monitor
//! costs one hash lookup at timer creation and nothing at runtime. The
//! summary is exposed through the `user.dwarfs.driver.perfmon` xattr and
//! printed at unmount; `perfmon_trace=FILE` additionally appends one JSON
//! line per timed section.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;

use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
struct OpMetrics {
    calls: u64,
    total_us: u64,
    min_us: u64,
    max_us: u64,
}

pub struct PerfMon {
    enabled: HashSet<String>,
    ops: Mutex<BTreeMap<String, OpMetrics>>,
    trace: Option<Mutex<File>>,
}

impl PerfMon {
    /// Build a monitor from the `perfmon=` option value. Returns `None`
    /// when no scopes are enabled, so callers skip timing entirely.
    pub fn create(
        enabled: impl IntoIterator<Item = String>,
        trace_path: Option<&Path>,
    ) -> Result<Option<Arc<Self>>> {
        let enabled: HashSet<String> = enabled.into_iter().collect();
        if enabled.is_empty() {
            return Ok(None);
        }

        let trace = match trace_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };

        Ok(Some(Arc::new(Self {
            enabled,
            ops: Mutex::new(BTreeMap::new()),
            trace,
        })))
    }

    pub fn is_enabled(&self, scope: &str) -> bool {
        self.enabled.contains(scope)
    }

    /// Start a timer for `scope.op`; records on drop. `None` when the
    /// scope is not enabled.
    pub fn timer(self: &Arc<Self>, scope: &'static str, op: &'static str) -> Option<PerfTimer> {
        if !self.is_enabled(scope) {
            return None;
        }
        Some(PerfTimer {
            mon: Arc::clone(self),
            scope,
            op,
            start: Instant::now(),
        })
    }

    fn record(&self, scope: &str, op: &str, elapsed_us: u64) {
        {
            let mut ops = self.ops.lock();
            let m = ops.entry(format!("{scope}.{op}")).or_default();
            m.calls += 1;
            m.total_us += elapsed_us;
            m.max_us = m.max_us.max(elapsed_us);
            m.min_us = if m.calls == 1 {
                elapsed_us
            } else {
                m.min_us.min(elapsed_us)
            };
        }

        if let Some(trace) = &self.trace {
            let line = json!({"section": format!("{scope}.{op}"), "us": elapsed_us});
            let mut file = trace.lock();
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "failed to write perfmon trace");
            }
        }
    }

    /// Render the textual summary served through the perfmon xattr.
    pub fn summarize(&self) -> String {
        let ops = self.ops.lock();
        let mut out = String::new();
        out.push_str("section                    calls   total[us]     avg[us]     min[us]     max[us]\n");
        for (name, m) in ops.iter() {
            let avg = if m.calls > 0 { m.total_us / m.calls } else { 0 };
            out.push_str(&format!(
                "{name:<24} {:>7} {:>11} {:>11} {:>11} {:>11}\n",
                m.calls, m.total_us, avg, m.min_us, m.max_us
            ));
        }
        if ops.is_empty() {
            out.push_str("(no sections recorded)\n");
        }
        out
    }

    /// Total calls recorded for one `scope.op` section.
    pub fn calls(&self, scope: &str, op: &str) -> u64 {
        self.ops
            .lock()
            .get(&format!("{scope}.{op}"))
            .map_or(0, |m| m.calls)
    }
}

pub struct PerfTimer {
    mon: Arc<PerfMon>,
    scope: &'static str,
    op: &'static str,
    start: Instant,
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_micros() as u64;
        self.mon.record(self.scope, self.op, elapsed);
    }
}
