//! Token Usage Aggregator
//!
//! Accumulates usage across the session's invocation tree. A node's own
//! direct usage enters through exactly two hook points — request start and
//! response end. Everything below the node arrives already flattened on
//! each sub-invocation's structured result payload and is merged in at most
//! once per result. Accounting never fails the operation it measures: an
//! unparseable payload degrades to a zero contribution and a warning.

use serde_json::Value;
use tracing::warn;

use crew_protocol::UsageCounter;

pub struct UsageAggregator {
    /// This node's own request/response usage.
    own: UsageCounter,
    /// Flattened sum of every absorbed descendant contribution.
    absorbed: UsageCounter,
    absorbed_count: u32,
    parse_failures: u32,
}

impl Default for UsageAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self {
            own: UsageCounter::default(),
            absorbed: UsageCounter::default(),
            absorbed_count: 0,
            parse_failures: 0,
        }
    }

    /// Request-start hook: the prompt size of a generation request issued
    /// by this node.
    pub fn record_request(&mut self, prompt_tokens: u64) {
        self.own = self.own.merge(UsageCounter::new(prompt_tokens, 0));
    }

    /// Response-end hook: the completion size of a generation response
    /// received by this node.
    pub fn record_response(&mut self, output_tokens: u64) {
        self.own = self.own.merge(UsageCounter::new(0, output_tokens));
    }

    /// Merge one sub-invocation's contribution from its structured result
    /// payload (mandatory `usage` field). Call once per result: the caller
    /// guards repeat results, this method guards everything else.
    ///
    /// Returns the counter that was merged — zero when the payload did not
    /// parse, which is logged and never an error.
    pub fn absorb_result(&mut self, payload: &Value) -> UsageCounter {
        let counter = match UsageCounter::from_result_payload(payload) {
            Some(counter) => counter,
            None => {
                self.parse_failures += 1;
                warn!("sub-invocation result carries no parseable usage, counting {{0,0}}");
                UsageCounter::default()
            }
        };
        self.absorbed = self.absorbed.merge(counter);
        self.absorbed_count += 1;
        counter
    }

    /// Merge an already-decoded counter (e.g. the turn usage reported on
    /// `agent_finish`).
    pub fn absorb_counter(&mut self, counter: UsageCounter) {
        self.absorbed = self.absorbed.merge(counter);
        self.absorbed_count += 1;
    }

    /// Final reported usage for the root: own direct usage plus the
    /// flattened sum of every descendant's extracted usage. Monotonically
    /// non-decreasing within a session.
    pub fn total(&self) -> UsageCounter {
        self.own.merge(self.absorbed)
    }

    /// How many sub-invocation contributions have been merged.
    pub fn absorbed_count(&self) -> u32 {
        self.absorbed_count
    }

    /// How many contributions degraded to zero because their payload did
    /// not parse.
    pub fn parse_failures(&self) -> u32 {
        self.parse_failures
    }
}
