//! Per-job options and the client → workflow → job default-merging rule.

use serde::{Deserialize, Serialize};

/// Dispatch order for a workflow's ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrder {
    Fifo,
    Lifo,
}

/// Deduplication window for jobs created with the same dedup id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduplication {
    pub id: String,
    pub ttl_ms: u64,
}

/// Sparse, mergeable per-job options. Every field is optional so that
/// [`JobOptions::merge`] can express "more specific wins, else fall back to
/// the less specific record" as a pure field-wise combinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub retries: Option<u32>,
    pub delay_ms: Option<u64>,
    pub priority: Option<i32>,
    pub order: Option<JobOrder>,
    pub deduplication: Option<Deduplication>,
    pub unique_job_id: Option<String>,
}

impl JobOptions {
    /// Combine two option records: fields present on `more_specific` win;
    /// otherwise this record's own value (if any) is kept. This is the
    /// deep-merge described for client → workflow → job option resolution:
    /// call it as `client.merge(workflow).merge(per_job)`.
    pub fn merge(self, more_specific: JobOptions) -> JobOptions {
        JobOptions {
            retries: more_specific.retries.or(self.retries),
            delay_ms: more_specific.delay_ms.or(self.delay_ms),
            priority: more_specific.priority.or(self.priority),
            order: more_specific.order.or(self.order),
            deduplication: more_specific.deduplication.or(self.deduplication),
            unique_job_id: more_specific.unique_job_id.or(self.unique_job_id),
        }
    }

    /// Apply the hard-coded engine baseline as the innermost merge input,
    /// producing a fully resolved record with no remaining gaps.
    pub fn resolve(self) -> ResolvedJobOptions {
        let baseline = ResolvedJobOptions::baseline();
        ResolvedJobOptions {
            retries: self.retries.unwrap_or(baseline.retries),
            delay_ms: self.delay_ms.unwrap_or(baseline.delay_ms),
            priority: self.priority.unwrap_or(baseline.priority),
            order: self.order.unwrap_or(baseline.order),
            deduplication: self.deduplication.or(baseline.deduplication),
            unique_job_id: self.unique_job_id.or(baseline.unique_job_id),
        }
    }
}

/// A fully resolved job-options record, with every field already defaulted.
/// This is what actually travels to the [`crate::queue::QueueAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedJobOptions {
    pub retries: u32,
    pub delay_ms: u64,
    pub priority: i32,
    pub order: JobOrder,
    pub deduplication: Option<Deduplication>,
    pub unique_job_id: Option<String>,
}

impl ResolvedJobOptions {
    fn baseline() -> Self {
        Self {
            retries: 0,
            delay_ms: 0,
            priority: 0,
            order: JobOrder::Fifo,
            deduplication: None,
            unique_job_id: None,
        }
    }
}

impl Default for ResolvedJobOptions {
    fn default() -> Self {
        Self::baseline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_more_specific_fields() {
        let client = JobOptions {
            retries: Some(3),
            priority: Some(1),
            ..Default::default()
        };
        let per_job = JobOptions {
            priority: Some(9),
            ..Default::default()
        };
        let merged = client.merge(per_job);
        assert_eq!(merged.retries, Some(3));
        assert_eq!(merged.priority, Some(9));
    }

    #[test]
    fn resolve_fills_gaps_with_baseline() {
        let resolved = JobOptions::default().resolve();
        assert_eq!(resolved.retries, 0);
        assert_eq!(resolved.delay_ms, 0);
        assert!(matches!(resolved.order, JobOrder::Fifo));
    }

    #[test]
    fn three_way_merge_resolves_client_workflow_job_precedence() {
        let client = JobOptions {
            retries: Some(1),
            ..Default::default()
        };
        let workflow = JobOptions {
            retries: Some(2),
            priority: Some(5),
            ..Default::default()
        };
        let job = JobOptions {
            priority: Some(10),
            ..Default::default()
        };
        let resolved = client.merge(workflow).merge(job).resolve();
        assert_eq!(resolved.retries, 2);
        assert_eq!(resolved.priority, 10);
    }
}
