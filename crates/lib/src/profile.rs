//! Invocation phase timing.
//!
//! The recorder collects coarse-grained trace events (one per phase or
//! per named unit of work) that the CLI can dump as JSON lines or render
//! as a plain-text report. This is bookkeeping, not metrics: events live
//! in memory for the duration of one invocation.

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// One timed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
  /// Coarse phase: `load`, `analysis`, `execute`.
  pub phase: String,

  /// What was timed, e.g. a module label or step id.
  pub name: String,

  /// Milliseconds since the recorder was created.
  pub start_ms: u64,

  pub duration_ms: u64,
}

/// Collects trace events for one invocation.
pub struct Recorder {
  epoch: Instant,
  events: Mutex<Vec<TraceEvent>>,
}

impl Default for Recorder {
  fn default() -> Self {
    Self::new()
  }
}

impl Recorder {
  pub fn new() -> Self {
    Self {
      epoch: Instant::now(),
      events: Mutex::new(Vec::new()),
    }
  }

  /// Record a span that started at `started` and just finished.
  pub fn record(&self, phase: impl Into<String>, name: impl Into<String>, started: Instant) {
    let start_ms = started.duration_since(self.epoch).as_millis() as u64;
    let duration_ms = started.elapsed().as_millis() as u64;
    self.events.lock().expect("recorder lock poisoned").push(TraceEvent {
      phase: phase.into(),
      name: name.into(),
      start_ms,
      duration_ms,
    });
  }

  pub fn events(&self) -> Vec<TraceEvent> {
    self.events.lock().expect("recorder lock poisoned").clone()
  }

  /// Write events as JSON lines.
  pub fn write_json_lines(&self, mut out: impl Write) -> std::io::Result<()> {
    for event in self.events() {
      let line = serde_json::to_string(&event).map_err(std::io::Error::other)?;
      writeln!(out, "{}", line)?;
    }
    Ok(())
  }

  /// Render a plain-text timing report, events in recorded order.
  pub fn render_text(&self) -> String {
    let mut out = String::new();
    for event in self.events() {
      out.push_str(&format!(
        "{:>8}ms  {:>8}ms  {:<10} {}\n",
        event.start_ms, event.duration_ms, event.phase, event.name
      ));
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn records_and_renders_events() {
    let recorder = Recorder::new();
    recorder.record("load", "//app:BUILD.lua", Instant::now());
    recorder.record("execute", "deadbeef", Instant::now());

    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase, "load");

    let text = recorder.render_text();
    assert!(text.contains("//app:BUILD.lua"));
    assert!(text.contains("execute"));
  }

  #[test]
  fn json_lines_are_one_event_per_line() {
    let recorder = Recorder::new();
    recorder.record("analysis", "//app:a", Instant::now());

    let mut buf = Vec::new();
    recorder.write_json_lines(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert_eq!(text.lines().count(), 1);

    let parsed: TraceEvent = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(parsed.name, "//app:a");
  }
}
