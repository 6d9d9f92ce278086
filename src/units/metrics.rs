// Resource sampling and limit checks for live units

use crate::advisory::forecast::Forecaster;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::models::{Metric, ResourceSample, UnitDefinition};
use crate::units::registry::Registry;
use crate::units::supervisor::Supervisor;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Cumulative usage counters of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawUsage {
    /// user + system CPU time consumed so far
    pub cpu_time: Duration,
    /// resident set size
    pub memory_bytes: u64,
}

/// Reads usage counters for a pid
#[cfg_attr(test, mockall::automock)]
pub trait ResourceSampler: Send + Sync {
    fn sample(&self, pid: u32) -> Result<RawUsage>;
}

/// Linux sampler backed by /proc/<pid>/stat and /proc/<pid>/status
#[derive(Debug, Clone)]
pub struct ProcSampler {
    clock_ticks: u64,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            clock_ticks: clock_ticks_per_second(),
        }
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn clock_ticks_per_second() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};

    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

#[cfg(not(unix))]
fn clock_ticks_per_second() -> u64 {
    100
}

impl ResourceSampler for ProcSampler {
    fn sample(&self, pid: u32) -> Result<RawUsage> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))?;
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid))?;

        let ticks = parse_stat_cpu_ticks(&stat)?;
        let rss_kb = parse_status_rss_kb(&status)?;

        Ok(RawUsage {
            cpu_time: Duration::from_secs_f64(ticks as f64 / self.clock_ticks as f64),
            memory_bytes: rss_kb * 1024,
        })
    }
}

/// utime + stime (in clock ticks) from /proc/<pid>/stat
pub fn parse_stat_cpu_ticks(content: &str) -> Result<u64> {
    // comm may contain spaces and parentheses, fields start after the last ')'
    let end = content
        .rfind(')')
        .ok_or_else(|| anyhow::anyhow!("Malformed stat line: missing command name"))?;
    let fields: Vec<&str> = content[end + 1..].split_whitespace().collect();
    if fields.len() < 13 {
        return Err(anyhow::anyhow!("Malformed stat line: {} fields", fields.len()));
    }

    let utime: u64 = fields[11].parse()?;
    let stime: u64 = fields[12].parse()?;
    Ok(utime + stime)
}

/// VmRSS (in kB) from /proc/<pid>/status
pub fn parse_status_rss_kb(content: &str) -> Result<u64> {
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("VmRSS:") {
            let kb = value
                .split_whitespace()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Malformed VmRSS line"))?;
            return Ok(kb.parse()?);
        }
    }
    // Kernel threads and zombies have no VmRSS
    Ok(0)
}

/// Calculate CPU percentage from two cumulative CPU times
pub fn calculate_cpu_percent(prev: Duration, curr: Duration, interval_secs: f64) -> f64 {
    if interval_secs <= 0.0 || curr <= prev {
        return 0.0;
    }

    let cpu_delta_secs = (curr - prev).as_secs_f64();
    (cpu_delta_secs / interval_secs) * 100.0
}

/// Format megabytes as a human-readable string (e.g., "460.00 MiB")
fn format_mb(mb: f64) -> String {
    use byte_unit::{Byte, UnitType};

    let byte = Byte::from_u64((mb.max(0.0) * 1024.0 * 1024.0) as u64);
    format!("{:.2}", byte.get_appropriate_unit(UnitType::Binary))
}

fn format_value(metric: Metric, value: f64) -> String {
    match metric {
        Metric::CpuPercent => format!("{:.1}%", value),
        Metric::MemoryMb => format_mb(value),
    }
}

/// Where a metric sits relative to its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitLevel {
    #[default]
    Normal,
    Warning,
    Breach,
}

#[derive(Debug, Clone, Copy)]
struct CpuReading {
    pid: u32,
    cpu_time: Duration,
    at: Instant,
}

#[derive(Default)]
struct MonitorInner {
    history: HashMap<String, VecDeque<ResourceSample>>,
    previous: HashMap<String, CpuReading>,
    levels: HashMap<(String, Metric), LimitLevel>,
    sink: Option<BufWriter<File>>,
}

/// Samples live units and reports limit crossings.
///
/// Advisory: crossing a limit only emits events, unless hard-kill is
/// enabled, in which case the process is killed and handled as a crash.
pub struct ResourceMonitor {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    sampler: Arc<dyn ResourceSampler>,
    events: Arc<EventLog>,
    interval: Duration,
    warn_fraction: f64,
    max_history: usize,
    hard_kill: bool,
    forecaster: Option<Arc<Forecaster>>,
    inner: Mutex<MonitorInner>,
}

impl ResourceMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        sampler: Arc<dyn ResourceSampler>,
        events: Arc<EventLog>,
        interval: Duration,
        warn_fraction: f64,
        max_history: usize,
        hard_kill: bool,
    ) -> Self {
        Self {
            registry,
            supervisor,
            sampler,
            events,
            interval,
            warn_fraction,
            max_history: max_history.max(1),
            hard_kill,
            forecaster: None,
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    /// Forward every sample to a forecaster
    pub fn with_forecaster(mut self, forecaster: Arc<Forecaster>) -> Self {
        self.forecaster = Some(forecaster);
        self
    }

    /// Append samples as JSON lines to `path`
    pub fn with_sample_log(self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.inner().sink = Some(BufWriter::new(file));
        Ok(self)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        if let Some(sink) = self.inner().sink.as_mut() {
            if let Err(e) = sink.flush() {
                tracing::warn!("Failed to flush sample log: {}", e);
            }
        }
        tracing::debug!("Resource monitor stopped");
    }

    /// Sample every live process once and return the new samples
    pub fn sweep(&self) -> Vec<ResourceSample> {
        let mut samples = Vec::new();

        for (unit, pid) in self.supervisor.live_processes() {
            let usage = match self.sampler.sample(pid) {
                Ok(usage) => usage,
                Err(e) => {
                    // Usually the process exited between listing and sampling
                    tracing::debug!("Could not sample {} (pid {}): {}", unit, pid, e);
                    continue;
                }
            };
            let Ok(def) = self.registry.definition(&unit) else {
                continue;
            };

            let sample = self.record(&unit, pid, usage);
            self.check_limits(&def, &sample);
            if let Some(forecaster) = &self.forecaster {
                forecaster.record(&sample);
            }
            samples.push(sample);
        }

        samples
    }

    fn record(&self, unit: &str, pid: u32, usage: RawUsage) -> ResourceSample {
        let now = Instant::now();
        let mut inner = self.inner();

        let reading = CpuReading {
            pid,
            cpu_time: usage.cpu_time,
            at: now,
        };
        let cpu_percent = match inner.previous.insert(unit.to_string(), reading) {
            Some(prev) if prev.pid == pid => calculate_cpu_percent(
                prev.cpu_time,
                usage.cpu_time,
                now.duration_since(prev.at).as_secs_f64(),
            ),
            Some(_) => {
                // New process: its limit levels start over
                inner.levels.retain(|(id, _), _| id != unit);
                0.0
            }
            None => 0.0,
        };

        let sample = ResourceSample {
            unit_id: unit.to_string(),
            timestamp: Utc::now(),
            cpu_percent,
            memory_mb: usage.memory_bytes as f64 / 1024.0 / 1024.0,
        };

        if let Some(sink) = inner.sink.as_mut() {
            match serde_json::to_string(&sample) {
                Ok(line) => {
                    if let Err(e) = writeln!(sink, "{}", line) {
                        tracing::warn!("Failed to persist sample of {}: {}", unit, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to encode sample of {}: {}", unit, e),
            }
        }

        let history = inner.history.entry(unit.to_string()).or_default();
        history.push_back(sample.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }

        sample
    }

    fn check_limits(&self, def: &UnitDefinition, sample: &ResourceSample) {
        for metric in Metric::ALL {
            let Some(limit) = def.limits.for_metric(metric) else {
                continue;
            };
            let value = sample.value(metric);
            let level = if value > limit {
                LimitLevel::Breach
            } else if value >= limit * self.warn_fraction {
                LimitLevel::Warning
            } else {
                LimitLevel::Normal
            };

            let previous = self
                .inner()
                .levels
                .insert((def.id.clone(), metric), level)
                .unwrap_or_default();
            if previous == level {
                continue;
            }
            self.report_transition(def, metric, previous, level, value, limit);
        }
    }

    fn report_transition(
        &self,
        def: &UnitDefinition,
        metric: Metric,
        previous: LimitLevel,
        level: LimitLevel,
        value: f64,
        limit: f64,
    ) {
        let unit = def.id.as_str();
        match level {
            LimitLevel::Warning if previous == LimitLevel::Normal => {
                self.events.append(
                    NewEvent::new(
                        EventKind::ResourceWarning,
                        Severity::Warning,
                        format!(
                            "{} at {} ({:.0}% of {} limit)",
                            metric.label(),
                            format_value(metric, value),
                            value / limit * 100.0,
                            format_value(metric, limit)
                        ),
                    )
                    .unit(unit),
                );
            }
            LimitLevel::Warning => {
                tracing::debug!("{} {} back under its limit", unit, metric.label());
            }
            LimitLevel::Breach => {
                let err = OrchestratorError::ResourceLimitBreach {
                    unit: unit.to_string(),
                    metric: metric.label().to_string(),
                    value,
                    limit,
                };
                self.events.append(
                    NewEvent::new(EventKind::ResourceBreach, Severity::Warning, err.to_string())
                        .unit(unit),
                );
                if self.hard_kill {
                    self.kill_for_breach(unit, metric);
                }
            }
            LimitLevel::Normal => {
                self.events.append(
                    NewEvent::new(
                        EventKind::ResourceRecovered,
                        Severity::Info,
                        format!(
                            "{} back to {} (limit {})",
                            metric.label(),
                            format_value(metric, value),
                            format_value(metric, limit)
                        ),
                    )
                    .unit(unit),
                );
            }
        }
    }

    fn kill_for_breach(&self, unit: &str, metric: Metric) {
        match self.supervisor.kill_unexpected(unit) {
            Ok(true) => {
                self.events.append(
                    NewEvent::new(
                        EventKind::ResourceKill,
                        Severity::Error,
                        format!("killed for exceeding its {} limit", metric.label()),
                    )
                    .unit(unit)
                    .action("kill"),
                );
            }
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to kill {} after limit breach: {}", unit, e),
        }
        // The next process starts from a clean slate
        let mut inner = self.inner();
        inner.levels.retain(|(id, _), _| id != unit);
        inner.previous.remove(unit);
    }

    /// Most recent sample of a unit
    pub fn latest(&self, unit: &str) -> Option<ResourceSample> {
        self.inner()
            .history
            .get(unit)
            .and_then(|h| h.back().cloned())
    }

    /// Sample history of a unit, oldest first
    pub fn history(&self, unit: &str) -> Vec<ResourceSample> {
        self.inner()
            .history
            .get(unit)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current limit level of a unit metric
    pub fn level(&self, unit: &str, metric: Metric) -> LimitLevel {
        self.inner()
            .levels
            .get(&(unit.to_string(), metric))
            .copied()
            .unwrap_or_default()
    }
}
