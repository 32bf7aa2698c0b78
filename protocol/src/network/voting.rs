//! Weighted voting for lightweight, advisory decisions.
//!
//! Each voter casts a scalar in `[0, 1]`. Votes are weighted by expertise
//! match, filtered for outliers around the median and then tallied against
//! the approval threshold. The outlier filter is a numeric heuristic only;
//! decisions that need real fault tolerance go through the three-phase
//! engine in [`consensus`](crate::network::consensus).

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{
    BASE_WEIGHT, EXPERTISE_WEIGHT, MAX_PENDING_RETRIES, MAX_WEIGHTED_RETRIES, OUTLIER_TOLERANCE,
};

/// One voter's scalar opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedVote {
    /// Voter node id.
    pub voter: String,
    /// Approval strength in `[0, 1]`.
    pub value: f64,
    /// Domain the voter claims expertise in.
    #[serde(default)]
    pub expertise: Option<String>,
}

/// Something to decide by weighted vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedProposal {
    /// Proposal id.
    pub id: String,
    /// Decision domain, matched against voter expertise.
    pub domain: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
}

/// Result of one tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedOutcome {
    /// Proposal id.
    pub proposal_id: String,
    /// Whether the approval ratio met the threshold.
    pub approved: bool,
    /// Weighted approve mass over weighted total mass.
    pub approval_ratio: f64,
    /// Votes kept after outlier rejection.
    pub accepted_votes: usize,
    /// Votes discarded as outliers or out of range.
    pub rejected_votes: usize,
}

/// Median of the values; `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Splits votes into kept and rejected.
///
/// Values outside `[0, 1]` (or NaN) are always rejected. The rest are kept
/// when their deviation from the median, relative to the median, is at most
/// [`OUTLIER_TOLERANCE`]. A zero median compares absolute deviation instead.
pub fn reject_outliers(votes: &[WeightedVote]) -> (Vec<WeightedVote>, usize) {
    let (in_range, mut rejected): (Vec<&WeightedVote>, usize) =
        votes.iter().fold((Vec::new(), 0), |(mut ok, bad), v| {
            if (0.0..=1.0).contains(&v.value) {
                ok.push(v);
                (ok, bad)
            } else {
                (ok, bad + 1)
            }
        });

    let values: Vec<f64> = in_range.iter().map(|v| v.value).collect();
    let Some(mid) = median(&values) else {
        return (Vec::new(), rejected);
    };

    let mut kept = Vec::with_capacity(in_range.len());
    for vote in in_range {
        let deviation = if mid == 0.0 {
            vote.value.abs()
        } else {
            (vote.value - mid).abs() / mid
        };
        if deviation <= OUTLIER_TOLERANCE {
            kept.push(vote.clone());
        } else {
            rejected += 1;
        }
    }
    (kept, rejected)
}

/// Weight of a vote: boosted when the voter's expertise matches `domain`.
pub fn vote_weight(vote: &WeightedVote, domain: &str) -> f64 {
    match &vote.expertise {
        Some(expertise) if expertise == domain => EXPERTISE_WEIGHT,
        _ => BASE_WEIGHT,
    }
}

/// Tallies votes for a proposal against `threshold`.
pub fn tally(proposal: &WeightedProposal, votes: &[WeightedVote], threshold: f64) -> WeightedOutcome {
    let (kept, rejected_votes) = reject_outliers(votes);

    let (approve, total) = kept.iter().fold((0.0, 0.0), |(approve, total), v| {
        let w = vote_weight(v, &proposal.domain);
        (approve + w * v.value, total + w)
    });
    let approval_ratio = if total > 0.0 { approve / total } else { 0.0 };

    WeightedOutcome {
        proposal_id: proposal.id.clone(),
        approved: total > 0.0 && approval_ratio >= threshold,
        approval_ratio,
        accepted_votes: kept.len(),
        rejected_votes,
    }
}

/// An unapproved proposal waiting to be voted on again.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRetry {
    /// The proposal.
    pub proposal: WeightedProposal,
    /// Tallies so far.
    pub attempts: u32,
}

/// Weighted-vote decider with a bounded retry queue.
pub struct WeightedVoting {
    threshold: f64,
    retries: Mutex<VecDeque<PendingRetry>>,
}

impl WeightedVoting {
    /// A decider approving at `threshold`.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            retries: Mutex::new(VecDeque::new()),
        }
    }

    /// Approval threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Tallies a proposal. Unapproved proposals are queued for retry until
    /// they have been tallied [`MAX_WEIGHTED_RETRIES`] times.
    pub fn decide(&self, proposal: &WeightedProposal, votes: &[WeightedVote]) -> WeightedOutcome {
        let previous = {
            let mut retries = self.retries.lock();
            let position = retries.iter().position(|r| r.proposal.id == proposal.id);
            position.and_then(|i| retries.remove(i))
        };
        let attempts = previous.map_or(1, |r| r.attempts + 1);
        self.record(proposal, votes, attempts)
    }

    /// Tallies a retry taken with [`take_retry`](Self::take_retry) against
    /// fresh votes. Its attempt count carries over.
    pub fn retry(&self, pending: PendingRetry, votes: &[WeightedVote]) -> WeightedOutcome {
        self.record(&pending.proposal, votes, pending.attempts + 1)
    }

    fn record(&self, proposal: &WeightedProposal, votes: &[WeightedVote], attempts: u32) -> WeightedOutcome {
        let outcome = tally(proposal, votes, self.threshold);
        let mut retries = self.retries.lock();
        retries.retain(|r| r.proposal.id != proposal.id);

        if outcome.approved {
            info!(proposal = %proposal.id, ratio = outcome.approval_ratio, "weighted decision approved");
        } else if attempts < MAX_WEIGHTED_RETRIES {
            debug!(proposal = %proposal.id, attempts, ratio = outcome.approval_ratio, "weighted decision queued for retry");
            if retries.len() >= MAX_PENDING_RETRIES {
                if let Some(evicted) = retries.pop_front() {
                    debug!(proposal = %evicted.proposal.id, "retry queue full, oldest retry dropped");
                }
            }
            retries.push_back(PendingRetry {
                proposal: proposal.clone(),
                attempts,
            });
        } else {
            debug!(proposal = %proposal.id, attempts, "weighted decision dropped after retries");
        }
        outcome
    }

    /// Removes and returns the oldest queued retry.
    pub fn take_retry(&self) -> Option<PendingRetry> {
        self.retries.lock().pop_front()
    }

    /// Number of proposals queued for retry.
    pub fn pending_retries(&self) -> usize {
        self.retries.lock().len()
    }
}
