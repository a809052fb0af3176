//! Token and dollar accounting for a turn.

use serde::{Deserialize, Serialize};

/// Accumulated cost for a turn or a single provider call.
///
/// Monoidal under componentwise addition; [`CostInfo::default`] is the zero
/// identity (`a + CostInfo::default() == a`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub cached_cost_usd: f64,
    pub total_cost_usd: f64,
}

impl CostInfo {
    pub fn new(input_tokens: u64, output_tokens: u64, total_cost_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_cost_usd,
            ..Default::default()
        }
    }

    /// Total token count across input, output, and cache reads.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cached_tokens
    }

    /// Componentwise accumulation, as used when folding per-call costs into
    /// `ctx.cost_info`.
    pub fn accumulate(&mut self, other: &CostInfo) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.input_cost_usd += other.input_cost_usd;
        self.output_cost_usd += other.output_cost_usd;
        self.cached_cost_usd += other.cached_cost_usd;
        self.total_cost_usd += other.total_cost_usd;
    }
}

impl std::ops::Add for CostInfo {
    type Output = CostInfo;

    fn add(self, rhs: CostInfo) -> CostInfo {
        let mut out = self;
        out.accumulate(&rhs);
        out
    }
}

impl std::iter::Sum for CostInfo {
    fn sum<I: Iterator<Item = CostInfo>>(iter: I) -> Self {
        iter.fold(CostInfo::default(), |acc, c| acc + c)
    }
}
