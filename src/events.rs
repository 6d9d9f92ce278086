// Append-only event log with broadcast subscription

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Starting,
    Started,
    SpawnFailed,
    StartupExit,
    UnexpectedExit,
    Stopping,
    Stopped,
    StopEscalated,
    Blocked,
    DependencyError,
    HealthChanged,
    RemediationSkipped,
    RestartScheduled,
    Restarted,
    Quarantined,
    QuarantineCleared,
    ResourceWarning,
    ResourceBreach,
    ResourceRecovered,
    ResourceKill,
    PredictionAlert,
    ShutdownStarted,
    ShutdownTimeout,
    ShutdownComplete,
}

/// A recorded state transition or action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub unit_id: Option<String>,
    pub kind: EventKind,
    pub severity: Severity,
    pub details: String,
    pub automated_action: Option<String>,
}

/// Event contents before the log assigns timestamp and sequence
#[derive(Debug, Clone)]
pub struct NewEvent {
    unit_id: Option<String>,
    kind: EventKind,
    severity: Severity,
    details: String,
    automated_action: Option<String>,
}

impl NewEvent {
    pub fn new(kind: EventKind, severity: Severity, details: impl Into<String>) -> Self {
        Self {
            unit_id: None,
            kind,
            severity,
            details: details.into(),
            automated_action: None,
        }
    }

    pub fn unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.automated_action = Some(action.into());
        self
    }
}

/// Filter for event queries
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub unit_id: Option<String>,
    pub min_severity: Option<Severity>,
    pub kind: Option<EventKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_unit(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: Some(unit_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(unit) = &self.unit_id {
            if event.unit_id.as_deref() != Some(unit.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

struct LogInner {
    entries: Vec<Event>,
    next_sequence: u64,
    sink: Option<BufWriter<File>>,
}

/// Append-only, totally ordered event log
pub struct EventLog {
    inner: Mutex<LogInner>,
    stream: broadcast::Sender<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// In-memory event log
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(LogInner {
                entries: Vec::new(),
                next_sequence: 1,
                sink: None,
            }),
            stream,
        }
    }

    /// Event log that also appends every event as a JSON line to `path`
    pub fn with_persistence(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let log = Self::new();
        log.lock().sink = Some(BufWriter::new(file));
        Ok(log)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event, assigning its timestamp and sequence number
    pub fn append(&self, new: NewEvent) -> Event {
        let event = {
            let mut inner = self.lock();
            let now = Utc::now();
            // Timestamps never go backwards, so (timestamp, sequence) order
            // matches append order even if the wall clock steps back.
            let timestamp = match inner.entries.last() {
                Some(last) if last.timestamp > now => last.timestamp,
                _ => now,
            };
            let event = Event {
                timestamp,
                sequence: inner.next_sequence,
                unit_id: new.unit_id,
                kind: new.kind,
                severity: new.severity,
                details: new.details,
                automated_action: new.automated_action,
            };
            inner.next_sequence += 1;

            if let Some(sink) = inner.sink.as_mut() {
                let written = serde_json::to_string(&event)
                    .map_err(std::io::Error::from)
                    .and_then(|line| writeln!(sink, "{}", line))
                    .and_then(|_| sink.flush());
                if let Err(e) = written {
                    tracing::warn!("Failed to persist event {}: {}", event.sequence, e);
                }
            }

            inner.entries.push(event.clone());
            // Sent under the lock so subscribers see sequence order; no subscribers is fine
            let _ = self.stream.send(event.clone());
            event
        };

        trace_event(&event);
        event
    }

    /// Subscribe to events appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.stream.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All events in (timestamp, sequence) order
    pub fn all(&self) -> Vec<Event> {
        self.lock().entries.clone()
    }

    /// Events matching a query, in log order
    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let mut matched: Vec<Event> = self
            .lock()
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            if matched.len() > limit {
                matched.drain(0..matched.len() - limit);
            }
        }
        matched
    }

    /// Read events persisted by a previous run
    pub fn load_history(path: &Path) -> Result<Vec<Event>> {
        let file = File::open(path)?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<Event>(&line)?);
        }
        events.sort_by(|a, b| (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)));
        Ok(events)
    }
}

fn trace_event(event: &Event) {
    let unit = event.unit_id.as_deref().unwrap_or("-");
    match event.severity {
        Severity::Info => tracing::info!("[{}] {:?}: {}", unit, event.kind, event.details),
        Severity::Warning => tracing::warn!("[{}] {:?}: {}", unit, event.kind, event.details),
        Severity::Error | Severity::Critical => {
            tracing::error!(
                "[{}] {} {:?}: {}",
                unit,
                event.severity.label(),
                event.kind,
                event.details
            )
        }
    }
}
