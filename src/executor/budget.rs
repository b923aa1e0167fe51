use std::sync::{Arc, Mutex};

use crate::schemas::TurnType;

/// Cross-agent global turn counter, shared by a parent run and every child
/// it spawns. Decremented as each turn begins; a turn starting at zero fails
/// the run with `turn_budget_exhausted`.
#[derive(Clone)]
pub struct TurnBudget(Arc<Mutex<Option<u32>>>);

impl TurnBudget {
    pub fn limited(turns: u32) -> Self {
        Self(Arc::new(Mutex::new(Some(turns))))
    }

    pub fn unlimited() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Consumes one turn; false when the budget is already spent.
    pub fn try_consume(&self) -> bool {
        let Ok(mut remaining) = self.0.lock() else {
            return false;
        };
        match remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    pub fn remaining(&self) -> Option<u32> {
        self.0.lock().ok().and_then(|r| *r)
    }
}

impl Default for TurnBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// The per-run work/retry budget state machine.
///
/// A turn is `normal` while more than one work turn remains; the last work
/// turn is `must_return`; after work is exhausted, remaining retry turns
/// cover invalid returns only.
#[derive(Debug, Clone)]
pub struct BudgetState {
    pub work_left: u32,
    pub retry_left: u32,
    retry_configured: u32,
}

impl BudgetState {
    pub fn new(max_turns: u32, retry_turns: u32) -> Self {
        Self {
            work_left: max_turns.max(1),
            retry_left: retry_turns,
            retry_configured: retry_turns,
        }
    }

    /// Type of the turn about to run, or `None` when nothing is left.
    pub fn next_turn_type(&self) -> Option<TurnType> {
        if self.work_left > 1 {
            Some(TurnType::Normal)
        } else if self.work_left == 1 {
            Some(TurnType::MustReturn)
        } else if self.retry_left > 0 {
            Some(TurnType::Retry)
        } else {
            None
        }
    }

    /// Accounts for a finished turn of the given type.
    pub fn consume(&mut self, turn_type: TurnType) {
        match turn_type {
            TurnType::Normal | TurnType::MustReturn => {
                self.work_left = self.work_left.saturating_sub(1)
            }
            TurnType::Retry => self.retry_left = self.retry_left.saturating_sub(1),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.work_left == 0 && self.retry_left == 0
    }

    /// Failure reason when the budget runs out.
    pub fn exhaustion_reason(&self) -> &'static str {
        if self.retry_configured == 0 {
            "max_turns_exceeded"
        } else {
            "budget_exhausted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_type_progression() {
        let mut budget = BudgetState::new(2, 1);
        assert_eq!(budget.next_turn_type(), Some(TurnType::Normal));
        budget.consume(TurnType::Normal);
        assert_eq!(budget.next_turn_type(), Some(TurnType::MustReturn));
        budget.consume(TurnType::MustReturn);
        assert_eq!(budget.next_turn_type(), Some(TurnType::Retry));
        budget.consume(TurnType::Retry);
        assert_eq!(budget.next_turn_type(), None);
        assert!(budget.exhausted());
        assert_eq!(budget.exhaustion_reason(), "budget_exhausted");
    }

    #[test]
    fn zero_retry_reports_max_turns() {
        let mut budget = BudgetState::new(1, 0);
        assert_eq!(budget.next_turn_type(), Some(TurnType::MustReturn));
        budget.consume(TurnType::MustReturn);
        assert_eq!(budget.next_turn_type(), None);
        assert_eq!(budget.exhaustion_reason(), "max_turns_exceeded");
    }

    #[test]
    fn shared_turn_budget_counts_down() {
        let budget = TurnBudget::limited(2);
        let clone = budget.clone();
        assert!(budget.try_consume());
        assert!(clone.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.remaining(), Some(0));
        assert!(TurnBudget::unlimited().try_consume());
    }
}
