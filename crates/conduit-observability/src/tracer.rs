use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conduit_core::{atomic, SessionId};

/// The kind of work unit a span represents. Mirrors the stages of a single
/// task's lifecycle as it moves through reasoning, tool calls, and memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    Llm,
    Tool,
    ToolBatch,
    Memory,
    Context,
    Reasoning,
    Prompt,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub span_type: SpanType,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub session_id: SessionId,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub spans: Vec<SpanRecord>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DailySummary {
    date: String,
    trace_count: u64,
    span_count: u64,
}

/// A handle to an open span. Dropping it without calling `set_attribute`
/// first is fine — the span is already recorded as started; `end()` finalizes
/// the timestamp and persists the parent trace.
pub struct SpanHandle {
    tracer: Arc<TracerInner>,
    index: usize,
}

impl SpanHandle {
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        let mut trace = self.tracer.current.lock().expect("tracer mutex poisoned");
        if let Some(trace) = trace.as_mut() {
            if let Some(span) = trace.spans.get_mut(self.index) {
                span.attributes.insert(key.into(), value.into());
            }
        }
    }

    pub fn end(self) {
        let mut trace = self.tracer.current.lock().expect("tracer mutex poisoned");
        if let Some(trace) = trace.as_mut() {
            if let Some(span) = trace.spans.get_mut(self.index) {
                span.ended_at_ms = Some(Utc::now().timestamp_millis());
            }
        }
    }
}

struct TracerInner {
    traces_dir: std::path::PathBuf,
    current: Mutex<Option<TraceRecord>>,
}

/// Records structured traces of a single task's execution for later
/// inspection — one JSON file per trace under `traces/<date>/`, plus a
/// rolling daily summary. Built on the same emit/record pattern as the hook
/// engine since both exist to observe, not to drive, execution.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    pub fn new(traces_dir: std::path::PathBuf) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                traces_dir,
                current: Mutex::new(None),
            }),
        }
    }

    /// Begin a new trace, replacing any still-open one. A still-open trace
    /// at this point means `end_trace` was never called for the previous
    /// task — it is discarded with a warning rather than persisted half-done.
    pub fn begin_trace(&self, session_id: SessionId, metadata: serde_json::Value) {
        let mut current = self.inner.current.lock().expect("tracer mutex poisoned");
        if current.is_some() {
            warn!(%session_id, "starting new trace while a previous trace was still open");
        }
        *current = Some(TraceRecord {
            session_id,
            started_at_ms: Utc::now().timestamp_millis(),
            ended_at_ms: None,
            metadata,
            spans: Vec::new(),
        });
    }

    /// Open a span within the current trace. No-op handle if no trace is open.
    pub fn span(&self, name: impl Into<String>, span_type: SpanType) -> SpanHandle {
        let mut current = self.inner.current.lock().expect("tracer mutex poisoned");
        let index = match current.as_mut() {
            Some(trace) => {
                trace.spans.push(SpanRecord {
                    name: name.into(),
                    span_type,
                    started_at_ms: Utc::now().timestamp_millis(),
                    ended_at_ms: None,
                    attributes: HashMap::new(),
                });
                trace.spans.len() - 1
            }
            None => 0,
        };
        SpanHandle {
            tracer: Arc::clone(&self.inner),
            index,
        }
    }

    /// Close and persist the current trace. Merges any extra metadata
    /// supplied at close time (e.g. final task status) into the trace's
    /// metadata object.
    pub fn end_trace(&self, extra_metadata: serde_json::Value) {
        let trace = {
            let mut current = self.inner.current.lock().expect("tracer mutex poisoned");
            match current.take() {
                Some(mut trace) => {
                    trace.ended_at_ms = Some(Utc::now().timestamp_millis());
                    if let (Some(existing), Some(extra)) =
                        (trace.metadata.as_object_mut(), extra_metadata.as_object())
                    {
                        for (k, v) in extra {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                    trace
                }
                None => {
                    warn!("end_trace called with no open trace");
                    return;
                }
            }
        };

        if let Err(e) = self.persist(&trace) {
            warn!(error = %e, "failed to persist trace");
        }
    }

    fn persist(&self, trace: &TraceRecord) -> conduit_core::Result<()> {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let day_dir = self.inner.traces_dir.join(&date);
        std::fs::create_dir_all(&day_dir)?;

        let trace_path = day_dir.join(format!("trace-{}.json", trace.session_id));
        atomic::write_json(&trace_path, trace)?;
        debug!(path = %trace_path.display(), "trace persisted");

        let summary_path = day_dir.join("daily_summary.json");
        let mut summary: DailySummary = atomic::read_json(&summary_path)?;
        if summary.date.is_empty() {
            summary.date = date;
        }
        summary.trace_count += 1;
        summary.span_count += trace.spans.len() as u64;
        atomic::write_json(&summary_path, &summary)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_records_attributes_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = Tracer::new(dir.path().to_path_buf());
        let session_id = SessionId::new();

        tracer.begin_trace(session_id, serde_json::json!({"channel": "cli"}));
        let span = tracer.span("llm_call", SpanType::Llm);
        span.set_attribute("model", "test-model");
        span.end();
        tracer.end_trace(serde_json::json!({"status": "completed"}));

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let trace_path = dir
            .path()
            .join(&date)
            .join(format!("trace-{}.json", session_id));
        assert!(trace_path.exists());

        let persisted: TraceRecord = atomic::read_json(&trace_path).unwrap();
        assert_eq!(persisted.spans.len(), 1);
        assert_eq!(persisted.spans[0].name, "llm_call");
        assert!(persisted.spans[0].ended_at_ms.is_some());
        assert_eq!(persisted.metadata["status"], "completed");
    }

    #[test]
    fn daily_summary_accumulates_counts() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = Tracer::new(dir.path().to_path_buf());

        for _ in 0..3 {
            tracer.begin_trace(SessionId::new(), serde_json::json!({}));
            tracer.span("step", SpanType::Task).end();
            tracer.end_trace(serde_json::json!({}));
        }

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let summary_path = dir.path().join(&date).join("daily_summary.json");
        let summary: DailySummary = atomic::read_json(&summary_path).unwrap();
        assert_eq!(summary.trace_count, 3);
        assert_eq!(summary.span_count, 3);
    }
}
