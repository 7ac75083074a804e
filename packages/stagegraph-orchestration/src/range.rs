//! Array-job range compression.
//!
//! Batch-array schedulers accept one contiguous range (`1-40`) or an
//! explicit list (`3,9,27`). A gapped pending set is widened to its span by
//! default; the submitted script only carries guarded blocks for pending
//! indices, so the extra indices in the span exit without doing anything.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Indices handed to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RangeSpec {
    Span { start: u32, end: u32 },
    List { indices: Vec<u32> },
}

impl RangeSpec {
    pub fn contains(&self, index: u32) -> bool {
        match self {
            RangeSpec::Span { start, end } => (*start..=*end).contains(&index),
            RangeSpec::List { indices } => indices.binary_search(&index).is_ok(),
        }
    }

    /// Every index the scheduler will start
    pub fn indices(&self) -> Vec<u32> {
        match self {
            RangeSpec::Span { start, end } => (*start..=*end).collect(),
            RangeSpec::List { indices } => indices.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            // Inverted spans are empty, like `start..=end`
            RangeSpec::Span { start, end } => (*end as usize + 1).saturating_sub(*start as usize),
            RangeSpec::List { indices } => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Span { start, end } if start == end => write!(f, "{}", start),
            RangeSpec::Span { start, end } => write!(f, "{}-{}", start, end),
            RangeSpec::List { indices } => {
                let parts: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// How gapped pending sets are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RangePolicy {
    /// Always submit `min..max`
    Span,
    /// Submit an explicit list for small, sparse pending sets
    Adaptive { max_list_len: usize },
}

impl Default for RangePolicy {
    fn default() -> Self {
        RangePolicy::Span
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeCompressor {
    policy: RangePolicy,
}

impl RangeCompressor {
    pub fn new(policy: RangePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// `pending` must be ascending, unique and within `1..=total`.
    pub fn compress(&self, pending: &[u32], total: u32) -> Result<RangeSpec> {
        let (first, last) = match (pending.first(), pending.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => {
                return Err(OrchestratorError::Submission {
                    stage: String::new(),
                    reason: "no pending tasks to compress into a range".to_string(),
                })
            }
        };
        if first == 0 || last > total || pending.windows(2).any(|w| w[0] >= w[1]) {
            return Err(OrchestratorError::validation(format!(
                "pending indices must be ascending within 1..={}",
                total
            )));
        }

        if pending.len() as u32 == total {
            return Ok(RangeSpec::Span {
                start: 1,
                end: total,
            });
        }

        let span = last - first + 1;
        let contiguous = span as usize == pending.len();

        match self.policy {
            RangePolicy::Adaptive { max_list_len }
                if !contiguous
                    && pending.len() <= max_list_len
                    && span as usize >= 2 * pending.len() =>
            {
                Ok(RangeSpec::List {
                    indices: pending.to_vec(),
                })
            }
            _ => Ok(RangeSpec::Span {
                start: first,
                end: last,
            }),
        }
    }
}
