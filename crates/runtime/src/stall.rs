//! Stall detection — pause runs caught in a loop.
//!
//! Per node, three last-value counters (output hash, diff hash,
//! verification-failure string) plus a sliding window of recent turn
//! summaries. A counter that reaches the threshold trips once,
//! producing the evidence for a `run.stalled` event; a user resume
//! clears the counters.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use ag_domain::StallEvidence;

const SUMMARY_WINDOW: usize = 3;

/// Hash of a turn signal (output text, diff text).
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{digest:x}")
}

#[derive(Default)]
struct RepeatCounter {
    last: Option<String>,
    count: u32,
}

impl RepeatCounter {
    /// Returns the streak length including this observation.
    fn observe(&mut self, value: Option<String>) -> u32 {
        match value {
            None => {
                self.last = None;
                self.count = 0;
            }
            Some(value) => {
                if self.last.as_ref() == Some(&value) {
                    self.count += 1;
                } else {
                    self.last = Some(value);
                    self.count = 1;
                }
            }
        }
        self.count
    }
}

#[derive(Default)]
struct NodeStallState {
    output: RepeatCounter,
    diff: RepeatCounter,
    verification: RepeatCounter,
    summaries: VecDeque<String>,
    tripped: bool,
}

/// What a completed turn feeds the detector.
pub struct TurnSignals {
    pub output: String,
    pub diff: String,
    pub verification_failure: Option<String>,
    pub summary: String,
}

pub struct StallDetector {
    threshold: u32,
    nodes: Mutex<HashMap<String, NodeStallState>>,
}

impl StallDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(2),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Record one completed turn. Returns evidence exactly once per
    /// streak when any counter reaches the threshold.
    pub fn observe(&self, node_id: &str, signals: TurnSignals) -> Option<StallEvidence> {
        let mut nodes = self.nodes.lock();
        let state = nodes.entry(node_id.to_owned()).or_default();

        state.summaries.push_back(signals.summary);
        while state.summaries.len() > SUMMARY_WINDOW {
            state.summaries.pop_front();
        }

        let output_hash = content_hash(&signals.output);
        let diff_hash = content_hash(&signals.diff);

        let output_streak = state.output.observe(Some(output_hash.clone()));
        // An empty diff repeats trivially between read-only turns; only
        // a non-empty diff counts as looping evidence.
        let diff_streak = if signals.diff.is_empty() {
            state.diff.observe(None)
        } else {
            state.diff.observe(Some(diff_hash.clone()))
        };
        let verification_streak = state
            .verification
            .observe(signals.verification_failure.clone());

        let repeats = output_streak.max(diff_streak).max(verification_streak);
        if repeats < self.threshold {
            state.tripped = false;
            return None;
        }
        if state.tripped {
            return None;
        }
        state.tripped = true;

        Some(StallEvidence {
            node_id: node_id.to_owned(),
            output_hash: (output_streak >= self.threshold).then_some(output_hash),
            diff_hash: (diff_streak >= self.threshold).then_some(diff_hash),
            verification_failure: (verification_streak >= self.threshold)
                .then(|| signals.verification_failure.unwrap_or_default()),
            repeats,
            summaries: state.summaries.iter().cloned().collect(),
        })
    }

    /// Clear the counters for a node (user resume).
    pub fn reset(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
    }

    pub fn reset_nodes(&self, node_ids: &[String]) {
        let mut nodes = self.nodes.lock();
        for id in node_ids {
            nodes.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(output: &str) -> TurnSignals {
        TurnSignals {
            output: output.into(),
            diff: String::new(),
            verification_failure: None,
            summary: output.into(),
        }
    }

    #[test]
    fn repeated_output_trips_at_threshold() {
        let detector = StallDetector::new(3);
        assert!(detector.observe("n", signals("stuck")).is_none());
        assert!(detector.observe("n", signals("stuck")).is_none());

        let evidence = detector.observe("n", signals("stuck")).unwrap();
        assert_eq!(evidence.repeats, 3);
        assert!(evidence.output_hash.is_some());
        assert!(evidence.diff_hash.is_none());
        assert!(evidence.summaries.iter().any(|s| s == "stuck"));
    }

    #[test]
    fn changing_output_resets_the_streak() {
        let detector = StallDetector::new(3);
        detector.observe("n", signals("a"));
        detector.observe("n", signals("a"));
        detector.observe("n", signals("b"));
        detector.observe("n", signals("a"));
        assert!(detector.observe("n", signals("a")).is_none());
    }

    #[test]
    fn trips_only_once_per_streak() {
        let detector = StallDetector::new(2);
        detector.observe("n", signals("x"));
        assert!(detector.observe("n", signals("x")).is_some());
        assert!(detector.observe("n", signals("x")).is_none());
        assert!(detector.observe("n", signals("x")).is_none());
    }

    #[test]
    fn reset_clears_the_streak() {
        let detector = StallDetector::new(2);
        detector.observe("n", signals("x"));
        detector.reset("n");
        assert!(detector.observe("n", signals("x")).is_none());
        assert!(detector.observe("n", signals("x")).is_some());
    }

    #[test]
    fn verification_failures_count_separately() {
        let detector = StallDetector::new(2);
        let failing = |out: &str| TurnSignals {
            output: out.into(),
            diff: String::new(),
            verification_failure: Some("cargo test (exit 101)".into()),
            summary: out.into(),
        };
        assert!(detector.observe("n", failing("one")).is_none());
        let evidence = detector.observe("n", failing("two")).unwrap();
        assert!(evidence.output_hash.is_none());
        assert_eq!(
            evidence.verification_failure.as_deref(),
            Some("cargo test (exit 101)")
        );
    }

    #[test]
    fn empty_diffs_do_not_accumulate() {
        let detector = StallDetector::new(2);
        let with_diff = |out: &str, diff: &str| TurnSignals {
            output: out.into(),
            diff: diff.into(),
            verification_failure: None,
            summary: out.into(),
        };
        detector.observe("n", with_diff("a", ""));
        let evidence = detector.observe("n", with_diff("b", ""));
        assert!(evidence.is_none());

        // Identical non-empty diffs do.
        detector.observe("n", with_diff("c", "+line"));
        let evidence = detector.observe("n", with_diff("d", "+line")).unwrap();
        assert!(evidence.diff_hash.is_some());
    }

    #[test]
    fn nodes_are_independent() {
        let detector = StallDetector::new(2);
        detector.observe("a", signals("x"));
        assert!(detector.observe("b", signals("x")).is_none());
    }

    #[test]
    fn summary_window_is_bounded() {
        let detector = StallDetector::new(10);
        for n in 0..6 {
            detector.observe("n", signals(&format!("s{n}")));
        }
        let nodes = detector.nodes.lock();
        assert_eq!(nodes["n"].summaries.len(), SUMMARY_WINDOW);
    }
}
