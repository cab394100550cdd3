#![forbid(unsafe_code)]

//! Structured diagnostic events and the bounded ledger that collects them.
//!
//! Every long-running computation (backward recursion, DC iteration, ray and
//! bisection searches, certifier retries) records one [`ReachEvent`] per
//! stage or iteration. The events travel back to the caller inside each
//! result struct; presentation is left to the caller.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Component that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Concatenator,
    Moments,
    InverseCdf,
    Lagrangian,
    ChanceOpen,
    ChanceAffine,
    SetSearch,
    Certifier,
    PatternSearch,
    Simulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Converged,
    Terminated,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

/// One entry of the diagnostic stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachEvent {
    pub component: Component,
    /// Stage index for recursions, iteration index for loops, direction index
    /// for per-direction searches.
    pub index: usize,
    pub kind: EventKind,
    pub metrics: Vec<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReachEvent {
    #[must_use]
    pub fn new(component: Component, index: usize, kind: EventKind) -> Self {
        Self {
            component,
            index,
            kind,
            metrics: Vec::new(),
            message: None,
        }
    }

    #[must_use]
    pub fn progress(component: Component, index: usize) -> Self {
        Self::new(component, index, EventKind::Progress)
    }

    #[must_use]
    pub fn warning(component: Component, index: usize, message: impl Into<String>) -> Self {
        Self::new(component, index, EventKind::Warning).with_message(message)
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.push(Metric {
            name: name.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Look up a metric by name.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|metric| metric.name == name)
            .map(|metric| metric.value)
    }

    #[must_use]
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    fn trace(&self) {
        let metrics = self
            .metrics
            .iter()
            .map(|metric| format!("{}={:.6e}", metric.name, metric.value))
            .collect::<Vec<_>>()
            .join(" ");
        let message = self.message.as_deref().unwrap_or("");
        match self.kind {
            EventKind::Progress => tracing::debug!(
                component = ?self.component,
                index = self.index,
                %metrics,
                "{message}"
            ),
            EventKind::Converged | EventKind::Terminated => tracing::info!(
                component = ?self.component,
                index = self.index,
                kind = ?self.kind,
                %metrics,
                "{message}"
            ),
            EventKind::Warning => tracing::warn!(
                component = ?self.component,
                index = self.index,
                %metrics,
                "{message}"
            ),
        }
    }
}

/// Bounded FIFO of diagnostic events.
///
/// Capacity is clamped to at least one entry. When full, the oldest entry is
/// evicted before the new one is appended. Every recorded event is mirrored
/// to `tracing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticLedger {
    capacity: usize,
    entries: VecDeque<ReachEvent>,
}

impl Default for DiagnosticLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl DiagnosticLedger {
    pub const DEFAULT_CAPACITY: usize = 4096;

    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, event: ReachEvent) {
        event.trace();
        if self.entries.len() == self.capacity {
            let _ = self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Move every event of `other` into this ledger, preserving order.
    pub fn absorb(&mut self, other: impl IntoIterator<Item = ReachEvent>) {
        for event in other {
            if self.entries.len() == self.capacity {
                let _ = self.entries.pop_front();
            }
            self.entries.push_back(event);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&ReachEvent> {
        self.entries.back()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReachEvent> {
        self.entries.iter()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ReachEvent> {
        self.entries
            .iter()
            .filter(|event| event.kind == EventKind::Warning)
    }

    #[must_use]
    pub fn serialize_jsonl(&self) -> String {
        self.entries
            .iter()
            .map(ReachEvent::to_json_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn into_events(self) -> Vec<ReachEvent> {
        self.entries.into_iter().collect()
    }
}
