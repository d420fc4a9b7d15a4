use crate::error::LocalizedSlotError;

/// Tracks localized slot failures during one walk.
///
/// Each failure spends one unit of budget. Once the budget is gone, slot and
/// register-map iteration is skipped for the rest of the walk, frames are
/// still reported, and the walk ends `STACK_CORRUPT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CorruptionGovernor {
    Armed { budget: u32, initial: u32 },
    Disabled { initial: u32 },
}

impl CorruptionGovernor {
    /// A budget of zero tolerates nothing: the first failure disables.
    pub(crate) fn new(budget: u32) -> Self {
        CorruptionGovernor::Armed {
            budget,
            initial: budget,
        }
    }

    fn initial(&self) -> u32 {
        match *self {
            CorruptionGovernor::Armed { initial, .. } | CorruptionGovernor::Disabled { initial } => initial,
        }
    }

    /// Restores the full budget. Called at the start of every walk.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.initial());
    }

    /// Slot iteration is suppressed.
    pub(crate) fn is_disabled(&self) -> bool {
        matches!(self, CorruptionGovernor::Disabled { .. })
    }

    pub(crate) fn remaining(&self) -> u32 {
        match *self {
            CorruptionGovernor::Armed { budget, .. } => budget,
            CorruptionGovernor::Disabled { .. } => 0,
        }
    }

    /// Spends one unit of budget on `err`.
    pub(crate) fn record(&mut self, during: &'static str, err: &LocalizedSlotError) {
        match *self {
            CorruptionGovernor::Armed { budget, initial } => {
                let budget = budget.saturating_sub(1);
                warn!(during, %err, remaining = budget, "slot iteration failed");
                if budget == 0 {
                    warn!("corruption budget exhausted, no longer iterating slots");
                    *self = CorruptionGovernor::Disabled { initial };
                } else {
                    *self = CorruptionGovernor::Armed { budget, initial };
                }
            }
            CorruptionGovernor::Disabled { .. } => {
                trace!(during, %err, "suppressed slot failure");
            }
        }
    }
}
