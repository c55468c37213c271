//! Budget evaluation: who may spend how much within the configured accounting window.

use std::{fmt, str::FromStr};

use crate::{domain::UserId, errors::Error, usage::CurrentCost, Result};

/// Accounting window the budget ceiling applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BudgetPeriod {
    Daily,
    #[default]
    Monthly,
    AllTime,
}

impl BudgetPeriod {
    /// Cost of `cost` that counts against the ceiling.
    pub fn select(self, cost: &CurrentCost) -> f64 {
        match self {
            BudgetPeriod::Daily => cost.today,
            BudgetPeriod::Monthly => cost.month,
            BudgetPeriod::AllTime => cost.all_time,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "today",
            BudgetPeriod::Monthly => "this month",
            BudgetPeriod::AllTime => "all-time",
        }
    }
}

impl FromStr for BudgetPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(BudgetPeriod::Daily),
            "monthly" => Ok(BudgetPeriod::Monthly),
            "all-time" | "all_time" | "alltime" => Ok(BudgetPeriod::AllTime),
            other => Err(Error::InvalidArgument(format!(
                "unknown budget period {other:?}, expected daily, monthly or all-time"
            ))),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::AllTime => "all-time",
        })
    }
}

/// Comma separated list from configuration, or `*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdList {
    Wildcard,
    Entries(Vec<String>),
}

impl IdList {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return IdList::Wildcard;
        }
        IdList::Entries(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Admin list: `-` (or nothing) means there are no admins.
    pub fn parse_admins(raw: &str) -> Self {
        match raw.trim() {
            "" | "-" => IdList::Entries(Vec::new()),
            other => IdList::parse(other),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, IdList::Wildcard)
    }

    /// Position of `user` among explicit entries.
    pub fn position(&self, user: UserId) -> Option<usize> {
        match self {
            IdList::Wildcard => None,
            IdList::Entries(v) => {
                let id = user.0.to_string();
                v.iter().position(|e| *e == id)
            }
        }
    }

    /// Explicitly listed (a wildcard lists nobody explicitly).
    pub fn lists(&self, user: UserId) -> bool {
        self.position(user).is_some()
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        match self {
            IdList::Wildcard => None,
            IdList::Entries(v) => v.get(idx).map(String::as_str),
        }
    }
}

/// Static budget configuration. The ceiling for a user is derived, never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetPolicy {
    pub admin_user_ids: IdList,
    pub allowed_user_ids: IdList,
    /// Parallel to `allowed_user_ids`, or `*` for unlimited.
    pub user_budgets: IdList,
    pub guest_budget: f64,
    pub period: BudgetPeriod,
}

impl BudgetPolicy {
    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_user_ids.lists(user)
    }

    pub fn is_allowed(&self, user: UserId) -> bool {
        self.allowed_user_ids.is_wildcard() || self.is_admin(user) || self.allowed_user_ids.lists(user)
    }

    /// Users whose spending is also pooled into the shared guests ledger.
    pub fn is_guest(&self, user: UserId) -> bool {
        !self.is_admin(user) && !self.allowed_user_ids.lists(user)
    }

    /// Spending ceiling for `user` within the configured period.
    pub fn ceiling(&self, user: UserId) -> f64 {
        if self.is_admin(user) || self.user_budgets.is_wildcard() {
            return f64::INFINITY;
        }

        let Some(idx) = self.allowed_user_ids.position(user) else {
            return self.guest_budget;
        };

        match self.user_budgets.get(idx) {
            Some(raw) => match raw.parse::<f64>() {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(user_id = user.0, budget = raw, error = %e, "unparsable user budget; using 0");
                    0.0
                }
            },
            None => {
                tracing::warn!(user_id = user.0, "no budget entry for allowed user; using 0");
                0.0
            }
        }
    }

    /// Ceiling minus what was already spent in the current period.
    pub fn remaining_budget(&self, user: UserId, cost: &CurrentCost) -> f64 {
        let ceiling = self.ceiling(user);
        if ceiling.is_infinite() {
            return ceiling;
        }
        ceiling - self.period.select(cost)
    }

    pub fn within_budget(&self, user: UserId, cost: &CurrentCost) -> bool {
        self.remaining_budget(user, cost) > 0.0
    }

    /// Gate a request, failing with `BudgetExceeded` when nothing is left.
    pub fn check(&self, user: UserId, cost: &CurrentCost) -> Result<f64> {
        let remaining = self.remaining_budget(user, cost);
        if remaining > 0.0 {
            Ok(remaining)
        } else {
            Err(Error::BudgetExceeded {
                user_id: user.0,
                remaining,
            })
        }
    }
}
