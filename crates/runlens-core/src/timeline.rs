//! Step timeline: ordered by step id, deduplicated by step id.
//!
//! Delivery is at-least-once and may be out of order (reconnects, snapshot
//! backfills), so the final timeline depends only on the set of ids received.

use crate::Step;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Duplicate,
}

impl MergeOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, MergeOutcome::Inserted)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    steps: Vec<Step>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        let mut timeline = Self::new();
        timeline.extend(steps);
        timeline
    }

    /// Pure merge: returns a new timeline, leaving `self` untouched.
    pub fn merge(&self, incoming: Step) -> Timeline {
        let mut next = self.clone();
        next.insert(incoming);
        next
    }

    pub fn insert(&mut self, incoming: Step) -> MergeOutcome {
        match self
            .steps
            .binary_search_by_key(&incoming.id, |step| step.id)
        {
            Ok(_) => MergeOutcome::Duplicate,
            Err(pos) => {
                self.steps.insert(pos, incoming);
                MergeOutcome::Inserted
            }
        }
    }

    /// Merges every step, returning how many were new.
    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) -> usize {
        steps
            .into_iter()
            .map(|step| self.insert(step))
            .filter(|outcome| outcome.is_inserted())
            .count()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn ids(&self) -> Vec<i64> {
        self.steps.iter().map(|step| step.id).collect()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.steps
            .binary_search_by_key(&id, |step| step.id)
            .is_ok()
    }

    pub fn get(&self, id: i64) -> Option<&Step> {
        self.steps
            .binary_search_by_key(&id, |step| step.id)
            .ok()
            .map(|idx| &self.steps[idx])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last_id(&self) -> Option<i64> {
        self.steps.last().map(|step| step.id)
    }

    pub fn stats(&self) -> TimelineStats {
        TimelineStats::from_steps(&self.steps)
    }
}

pub fn merge(current: &Timeline, incoming: Step) -> Timeline {
    current.merge(incoming)
}

/// Read-only figures derived from a timeline on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineStats {
    pub count: usize,
    pub by_type: BTreeMap<String, usize>,
    pub max_latency_ms: Option<f64>,
    pub mean_latency_ms: Option<f64>,
}

impl TimelineStats {
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut by_type = BTreeMap::new();
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;
        let mut max_latency_ms: Option<f64> = None;
        for step in steps {
            *by_type.entry(step.step_type.clone()).or_insert(0) += 1;
            if let Some(latency) = step.measured_latency_ms() {
                latency_sum += latency;
                latency_count += 1;
                max_latency_ms = Some(max_latency_ms.map_or(latency, |max| max.max(latency)));
            }
        }
        let mean_latency_ms = if latency_count > 0 {
            Some(latency_sum / latency_count as f64)
        } else {
            None
        };
        Self {
            count: steps.len(),
            by_type,
            max_latency_ms,
            mean_latency_ms,
        }
    }

    /// `(type, count)` pairs ordered by type name.
    pub fn type_counts(&self) -> Vec<(&str, usize)> {
        self.by_type
            .iter()
            .map(|(step_type, count)| (step_type.as_str(), *count))
            .collect()
    }
}
