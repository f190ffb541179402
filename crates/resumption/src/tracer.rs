//! Continuation cache tracing.
//!
//! Provides a trait-based tracing system for the continuation cache. When using
//! [`NoopTracer`], all trace hooks compile away through monomorphization.
//!
//! # Architecture
//!
//! The [`ResumeTracer`] trait defines hook points at the cache's decision points
//! (hit, miss, lineage redirect, generation, fault). Concrete implementations:
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (default) |
//! | [`StderrTracer`] | Human-readable log to stderr |
//! | [`CountingTracer`] | Hit/miss/generation counters |
//! | [`RecordingTracer`] | Full event recording for tests and post-mortems |
//!
//! # Usage
//!
//! ```
//! use resumption::{ContinuationCache, Era, RecordingTracer, ReferenceCompiler, ResumeConfig};
//!
//! let cache = ContinuationCache::with_parts(
//!     Era::RegionTable,
//!     ResumeConfig::default(),
//!     ReferenceCompiler,
//!     RecordingTracer::new(),
//! );
//! assert_eq!(cache.tracer().event_count(), 0);
//! ```

use std::fmt;

use serde::Serialize;

use crate::error::ResumeError;

/// Trace event emitted by the continuation cache.
///
/// Used by [`RecordingTracer`]; serializes to JSON with an `event` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResumeEvent {
    /// A memoized unit was returned.
    Hit { unit: String, line: u32, offset: u32 },
    /// No memoized unit exists for the request.
    Miss { unit: String, line: u32, offset: u32 },
    /// A request against a generated unit was moved into its root's offsets.
    Redirect {
        from: String,
        root: String,
        from_offset: u32,
        root_offset: u32,
    },
    /// A new resume unit was synthesized from `root`.
    Generated {
        root: String,
        unit: String,
        line: u32,
        offset: u32,
    },
    /// The request failed.
    Fault { unit: String, kind: String, message: String },
}

/// Trait for continuation cache tracing.
///
/// All methods have default no-op implementations, so [`NoopTracer`] is empty.
/// The cache carries the tracer as a type parameter, so no-op hooks inline away.
pub trait ResumeTracer: fmt::Debug {
    /// Called when a request is answered from the memo table.
    #[inline(always)]
    fn on_hit(&mut self, _unit: &str, _line: u32, _offset: u32) {}

    /// Called when a request is not in the memo table.
    #[inline(always)]
    fn on_miss(&mut self, _unit: &str, _line: u32, _offset: u32) {}

    /// Called when a request against a generated unit is redirected to its root.
    #[inline(always)]
    fn on_redirect(&mut self, _from: &str, _root: &str, _from_offset: u32, _root_offset: u32) {}

    /// Called after a new resume unit has been synthesized and registered.
    #[inline(always)]
    fn on_generated(&mut self, _root: &str, _unit: &str, _line: u32, _offset: u32) {}

    /// Called when a request fails, before the error is returned.
    #[inline(always)]
    fn on_fault(&mut self, _unit: &str, _error: &ResumeError) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl ResumeTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints a human-readable log to stderr.
///
/// Output format:
/// ```text
///   ??? MISS f               line=3  offset=12
///   +++ GEN  __resume_in_f_at_3 from f
///   ==> HIT  f               line=3  offset=12
/// ```
#[derive(Debug)]
pub struct StderrTracer {
    /// Maximum number of lines to print. None = unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            limit: None,
            count: 0,
            stopped: false,
        }
    }

    /// Creates a stderr tracer that stops after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    fn line(&mut self, text: fmt::Arguments<'_>) {
        if self.stopped {
            return;
        }
        eprintln!("{text}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} lines) ---");
            self.stopped = true;
        }
    }
}

impl Default for StderrTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeTracer for StderrTracer {
    fn on_hit(&mut self, unit: &str, line: u32, offset: u32) {
        self.line(format_args!("  ==> HIT  {unit:<20} line={line}  offset={offset}"));
    }

    fn on_miss(&mut self, unit: &str, line: u32, offset: u32) {
        self.line(format_args!("  ??? MISS {unit:<20} line={line}  offset={offset}"));
    }

    fn on_redirect(&mut self, from: &str, root: &str, from_offset: u32, root_offset: u32) {
        self.line(format_args!("  --> REDIRECT {from}@{from_offset} to {root}@{root_offset}"));
    }

    fn on_generated(&mut self, root: &str, unit: &str, _line: u32, _offset: u32) {
        self.line(format_args!("  +++ GEN  {unit} from {root}"));
    }

    fn on_fault(&mut self, unit: &str, error: &ResumeError) {
        self.line(format_args!("  !!! FAULT {unit}: {error}"));
    }
}

// ============================================================================
// CountingTracer
// ============================================================================

/// Tracer that counts cache outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountingTracer {
    pub hits: usize,
    pub misses: usize,
    pub redirects: usize,
    pub generated: usize,
    pub faults: usize,
}

impl CountingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeTracer for CountingTracer {
    fn on_hit(&mut self, _unit: &str, _line: u32, _offset: u32) {
        self.hits += 1;
    }

    fn on_miss(&mut self, _unit: &str, _line: u32, _offset: u32) {
        self.misses += 1;
    }

    fn on_redirect(&mut self, _from: &str, _root: &str, _from_offset: u32, _root_offset: u32) {
        self.redirects += 1;
    }

    fn on_generated(&mut self, _root: &str, _unit: &str, _line: u32, _offset: u32) {
        self.generated += 1;
    }

    fn on_fault(&mut self, _unit: &str, _error: &ResumeError) {
        self.faults += 1;
    }
}

impl fmt::Display for CountingTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Continuation Cache ===")?;
        writeln!(f, "Hits:      {}", self.hits)?;
        writeln!(f, "Misses:    {}", self.misses)?;
        writeln!(f, "Redirects: {}", self.redirects)?;
        writeln!(f, "Generated: {}", self.generated)?;
        write!(f, "Faults:    {}", self.faults)
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Tracer that records every event in order.
#[derive(Debug)]
pub struct RecordingTracer {
    events: Vec<ResumeEvent>,
    /// Optional limit on number of events recorded.
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            limit: None,
        }
    }

    /// Creates a recording tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[ResumeEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<ResumeEvent> {
        self.events
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn record(&mut self, event: ResumeEvent) {
        if self.limit.is_some_and(|l| self.events.len() >= l) {
            return;
        }
        self.events.push(event);
    }
}

impl Default for RecordingTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeTracer for RecordingTracer {
    fn on_hit(&mut self, unit: &str, line: u32, offset: u32) {
        self.record(ResumeEvent::Hit {
            unit: unit.to_owned(),
            line,
            offset,
        });
    }

    fn on_miss(&mut self, unit: &str, line: u32, offset: u32) {
        self.record(ResumeEvent::Miss {
            unit: unit.to_owned(),
            line,
            offset,
        });
    }

    fn on_redirect(&mut self, from: &str, root: &str, from_offset: u32, root_offset: u32) {
        self.record(ResumeEvent::Redirect {
            from: from.to_owned(),
            root: root.to_owned(),
            from_offset,
            root_offset,
        });
    }

    fn on_generated(&mut self, root: &str, unit: &str, line: u32, offset: u32) {
        self.record(ResumeEvent::Generated {
            root: root.to_owned(),
            unit: unit.to_owned(),
            line,
            offset,
        });
    }

    fn on_fault(&mut self, unit: &str, error: &ResumeError) {
        self.record(ResumeEvent::Fault {
            unit: unit.to_owned(),
            kind: error.kind().to_owned(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_respects_limit() {
        let mut tracer = RecordingTracer::with_limit(1);
        tracer.on_miss("f", 1, 0);
        tracer.on_hit("f", 1, 0);
        assert_eq!(tracer.event_count(), 1);
        assert!(matches!(tracer.events()[0], ResumeEvent::Miss { .. }));
    }

    #[test]
    fn counting_tracer_report() {
        let mut tracer = CountingTracer::new();
        tracer.on_miss("f", 1, 0);
        tracer.on_generated("f", "g", 1, 0);
        tracer.on_hit("f", 1, 0);
        assert_eq!((tracer.hits, tracer.misses, tracer.generated), (1, 1, 1));
        assert!(tracer.to_string().contains("Generated: 1"));
    }
}
