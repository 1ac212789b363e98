//! Pipeline diagnostics: an injected sink instead of a process-wide logger.
//!
//! Components receive an `Arc<dyn EventSink>` at construction and report
//! outcomes through it. `EventLog` forwards each event to `tracing` and keeps
//! a bounded history plus per-kind counters so operators (and tests) can
//! inspect what happened without scraping logs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::DeliveryState;

/// Maximum events kept in the in-memory history.
const HISTORY_CAPACITY: usize = 100;

/// Something worth recording about the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    FiringStarted { job: String },
    FiringCompleted { job: String, elapsed_ms: u64 },
    FiringFailed { job: String, error: String },
    /// Previous firing still running at trigger time.
    FiringSkipped { job: String, reason: String },
    /// Shutdown grace period ran out before the firing finished.
    FiringAborted { job: String },
    SummaryComputed { total_amount: Decimal, item_count: usize },
    PublishRetry { attempt: u32, error: String },
    Published { message_id: String, attempts: u32 },
    PublishFailed { message_id: String, error: String },
    DeliveryTransition { message_id: String, state: DeliveryState, attempt: u32 },
    DeliveryError { message_id: String, error: String },
    ConsumerReconnect { attempt: u32, error: String },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::FiringStarted { .. } => "firing_started",
            PipelineEvent::FiringCompleted { .. } => "firing_completed",
            PipelineEvent::FiringFailed { .. } => "firing_failed",
            PipelineEvent::FiringSkipped { .. } => "firing_skipped",
            PipelineEvent::FiringAborted { .. } => "firing_aborted",
            PipelineEvent::SummaryComputed { .. } => "summary_computed",
            PipelineEvent::PublishRetry { .. } => "publish_retry",
            PipelineEvent::Published { .. } => "published",
            PipelineEvent::PublishFailed { .. } => "publish_failed",
            PipelineEvent::DeliveryTransition { state, .. } => match state {
                DeliveryState::Received => "delivery_received",
                DeliveryState::Processing => "delivery_processing",
                DeliveryState::Acknowledged => "delivery_acknowledged",
                DeliveryState::Requeued => "delivery_requeued",
                DeliveryState::DeadLettered => "delivery_dead_lettered",
            },
            PipelineEvent::DeliveryError { .. } => "delivery_error",
            PipelineEvent::ConsumerReconnect { .. } => "consumer_reconnect",
        }
    }

    fn trace(&self) {
        match self {
            PipelineEvent::FiringStarted { job } => tracing::info!("⏰ Firing '{job}' started"),
            PipelineEvent::FiringCompleted { job, elapsed_ms } => {
                tracing::info!("✅ Firing '{job}' completed in {elapsed_ms}ms")
            }
            PipelineEvent::FiringFailed { job, error } => {
                tracing::error!("❌ Firing '{job}' failed: {error}")
            }
            PipelineEvent::FiringSkipped { job, reason } => {
                tracing::warn!("⚠️ Firing '{job}' skipped: {reason}")
            }
            PipelineEvent::FiringAborted { job } => {
                tracing::warn!("🛑 Firing '{job}' aborted after shutdown grace period")
            }
            PipelineEvent::SummaryComputed {
                total_amount,
                item_count,
            } => tracing::info!("📊 Summary computed: total={total_amount}, items={item_count}"),
            PipelineEvent::PublishRetry { attempt, error } => {
                tracing::warn!("🔁 Publish attempt {attempt} failed, retrying: {error}")
            }
            PipelineEvent::Published {
                message_id,
                attempts,
            } => tracing::info!("📤 Summary {message_id} confirmed by broker (attempts: {attempts})"),
            PipelineEvent::PublishFailed { message_id, error } => {
                tracing::error!("❌ Summary {message_id} not delivered: {error}")
            }
            PipelineEvent::DeliveryTransition {
                message_id,
                state,
                attempt,
            } => match state {
                DeliveryState::DeadLettered => {
                    tracing::warn!("☠️ Message {message_id} dead-lettered (attempt {attempt})")
                }
                DeliveryState::Requeued => {
                    tracing::warn!("🔁 Message {message_id} requeued (attempt {attempt})")
                }
                _ => tracing::debug!("📨 Message {message_id} → {state} (attempt {attempt})"),
            },
            PipelineEvent::DeliveryError { message_id, error } => {
                tracing::error!("❌ Message {message_id}: {error}")
            }
            PipelineEvent::ConsumerReconnect { attempt, error } => {
                tracing::warn!("🔌 Consumer reconnect #{attempt}: {error}")
            }
        }
    }
}

/// Where components report pipeline events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: PipelineEvent);
}

/// A recorded event with its timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub event: PipelineEvent,
}

#[derive(Default)]
struct EventLogState {
    history: VecDeque<EventRecord>,
    counts: HashMap<&'static str, u64>,
}

/// Tracing-backed sink with a ring buffer of recent events.
#[derive(Default)]
pub struct EventLog {
    state: Mutex<EventLogState>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<EventRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.history.iter().cloned().collect()
    }

    /// Recent events without timestamps.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.history().into_iter().map(|r| r.event).collect()
    }

    /// How many events of `kind` were recorded since startup.
    pub fn count(&self, kind: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.counts.get(kind).copied().unwrap_or(0)
    }
}

impl EventSink for EventLog {
    fn record(&self, event: PipelineEvent) {
        event.trace();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state.counts.entry(event.kind()).or_insert(0) += 1;
        state.history.push_back(EventRecord {
            at: Utc::now(),
            event,
        });
        if state.history.len() > HISTORY_CAPACITY {
            state.history.pop_front();
        }
    }
}
