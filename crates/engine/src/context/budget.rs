//! Budget manager.
//!
//! `available = limit − base_prompt_tokens − safety_margin`, where the
//! margin shrinks as pressure rises across retries. The result never
//! drops below the emergency floor while the floor itself fits under the
//! limit; past that point only the mandatory elements are sent.

use contextloom_config::BudgetConfig;
use contextloom_core::error::ContextError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The token budget for one assembly cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Model context limit
    pub limit: usize,
    /// System instructions + tool schemas + current user message
    pub reserved_overhead: usize,
    pub safety_margin: usize,
    /// Tokens available for history
    pub available: usize,
    /// Allowed overshoot, as a fraction of `available`
    pub tolerance: f64,
    /// Set when `available` was raised to the emergency floor
    #[serde(default)]
    pub floored: bool,
    /// Mandatory elements only: not even the floor fits
    pub emergency: bool,
}

impl Budget {
    /// A budget of exactly `available` tokens with no overhead.
    pub fn fixed(available: usize, tolerance: f64) -> Self {
        Self {
            limit: available,
            reserved_overhead: 0,
            safety_margin: 0,
            available,
            tolerance,
            floored: false,
            emergency: false,
        }
    }

    /// Nothing fits besides the mandatory elements.
    pub fn emergency(limit: usize, reserved_overhead: usize, safety_margin: usize) -> Self {
        Self {
            limit,
            reserved_overhead,
            safety_margin,
            available: 0,
            tolerance: 0.0,
            floored: false,
            emergency: true,
        }
    }

    /// Largest total that still counts as within budget.
    pub fn ceiling(&self) -> usize {
        (self.available as f64 * (1.0 + self.tolerance)).floor() as usize
    }

    pub fn fits(&self, total: usize) -> bool {
        total <= self.ceiling()
    }
}

/// Computes budgets for a model limit.
#[derive(Debug, Clone)]
pub struct BudgetManager {
    limit: usize,
    margins: Vec<usize>,
    emergency_floor: usize,
    tolerance: f64,
}

impl BudgetManager {
    pub fn new(limit: usize, config: &BudgetConfig) -> Self {
        Self {
            limit,
            margins: config.safety_margins.clone(),
            emergency_floor: config.emergency_floor,
            tolerance: config.tolerance,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Safety margin at a pressure level; saturates at the smallest.
    pub fn margin_for(&self, pressure: usize) -> usize {
        match self.margins.get(pressure) {
            Some(m) => *m,
            None => self.margins.last().copied().unwrap_or(0),
        }
    }

    /// Budget available for history at `pressure`.
    ///
    /// Falls back to the smallest margin when the selected one leaves
    /// nothing, then raises the result to the emergency floor. Returns
    /// `BudgetExceeded` when the limit cannot hold the base prompt plus
    /// the floor.
    pub fn available_budget(
        &self,
        base_prompt_tokens: usize,
        pressure: usize,
    ) -> Result<Budget, ContextError> {
        let mut margin = self.margin_for(pressure);
        let mut available = self.remaining(base_prompt_tokens, margin);

        if available == 0 {
            let smallest = self.margins.last().copied().unwrap_or(0);
            if smallest < margin {
                debug!(from = margin, to = smallest, "Falling back to smallest safety margin");
                margin = smallest;
                available = self.remaining(base_prompt_tokens, margin);
            }
        }

        let headroom = self.limit.saturating_sub(base_prompt_tokens);
        if headroom < self.emergency_floor.max(1) {
            return Err(ContextError::BudgetExceeded {
                limit: self.limit,
                base_prompt_tokens,
                margin,
            });
        }

        let floored = available < self.emergency_floor;
        if floored {
            warn!(
                available,
                floor = self.emergency_floor,
                "Budget below emergency floor, raising it to the floor"
            );
            available = self.emergency_floor;
        }

        Ok(Budget {
            limit: self.limit,
            reserved_overhead: base_prompt_tokens,
            safety_margin: margin,
            available,
            tolerance: self.tolerance,
            floored,
            emergency: false,
        })
    }

    fn remaining(&self, base: usize, margin: usize) -> usize {
        self.limit.saturating_sub(base).saturating_sub(margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(limit: usize) -> BudgetManager {
        BudgetManager::new(limit, &BudgetConfig::default())
    }

    #[test]
    fn margin_shrinks_with_pressure() {
        let m = manager(10_000);
        let margins: Vec<usize> = (0..7).map(|p| m.margin_for(p)).collect();
        assert_eq!(margins, vec![2000, 1000, 500, 200, 50, 50, 50]);
    }

    #[test]
    fn available_subtracts_overhead_and_margin() {
        let budget = manager(10_000).available_budget(3_000, 0).unwrap();
        assert_eq!(budget.available, 5_000);
        assert_eq!(budget.safety_margin, 2000);
        assert_eq!(budget.reserved_overhead, 3_000);
        assert!(!budget.emergency);

        let pressured = manager(10_000).available_budget(3_000, 2).unwrap();
        assert_eq!(pressured.available, 6_500);
    }

    #[test]
    fn falls_back_to_smallest_margin() {
        // 4000 − 2500 − 2000 ≤ 0, but 4000 − 2500 − 50 > 0
        let budget = manager(4_000).available_budget(2_500, 0).unwrap();
        assert_eq!(budget.safety_margin, 50);
        assert_eq!(budget.available, 1_450);
    }

    #[test]
    fn exceeded_when_even_smallest_margin_fails() {
        let err = manager(1_000).available_budget(990, 0).unwrap_err();
        assert_eq!(
            err,
            ContextError::BudgetExceeded {
                limit: 1_000,
                base_prompt_tokens: 990,
                margin: 50,
            }
        );
    }

    #[test]
    fn small_positive_budget_is_raised_to_floor() {
        let budget = manager(1_000).available_budget(920, 4).unwrap();
        assert_eq!(budget.available, 50);
        assert!(budget.floored);
        assert!(!budget.emergency);

        // 2040 − 5 − 2000 = 35, still below the floor
        let budget = manager(2_040).available_budget(5, 0).unwrap();
        assert_eq!(budget.available, 50);
        assert_eq!(budget.safety_margin, 2000);
    }

    #[test]
    fn exhausted_margins_still_get_the_floor() {
        // 1060 − 1000 − 2000 and 1060 − 1000 − 50 leave ≤ 10, the floor fits in 60
        let budget = manager(1_060).available_budget(1_000, 0).unwrap();
        assert_eq!(budget.available, 50);
        assert_eq!(budget.safety_margin, 50);
        assert!(budget.floored);
    }

    #[test]
    fn ceiling_applies_tolerance() {
        let budget = Budget::fixed(1_000, 0.05);
        assert_eq!(budget.ceiling(), 1_050);
        assert!(budget.fits(1_050));
        assert!(!budget.fits(1_051));
    }
}
