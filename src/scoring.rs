//! Cart scoring against the game rules.
//!
//! A cart is checked against three gates in order: exactly five distinct
//! bags, total within budget, at most five of any item. Any failed gate scores
//! the cart 0. A passing cart scores
//! `max(0, target - |target - total|) + under_budget_bonus + time_bonus`.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameRules {
    pub target_price: f64,
    pub required_bags: usize,
    pub max_per_bag: u32,
    pub under_budget_bonus: f64,
    /// Games finished within this many seconds earn a time bonus.
    pub time_bonus_window_secs: f64,
    pub time_bonus_max: f64,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            target_price: 100.0,
            required_bags: 5,
            max_per_bag: 5,
            under_budget_bonus: 5.0,
            time_bonus_window_secs: 120.0,
            time_bonus_max: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(name: impl Into<String>, price: f64, quantity: u32) -> Self {
        Self {
            name: name.into(),
            price,
            quantity,
        }
    }

    pub fn subtotal(&self) -> f64 {
        from_cents(self.subtotal_cents())
    }

    /// Line total in whole cents, so sums and budget checks stay exact.
    pub fn subtotal_cents(&self) -> i64 {
        to_cents(self.price) * i64::from(self.quantity)
    }
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// A game rule the cart broke.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    BagCount { found: usize, required: usize },
    OverBudget { total: f64, target: f64 },
    BagOverfilled { name: String, quantity: u32, max: u32 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BagCount { found, required } => {
                write!(f, "wrong number of bags ({found}/{required})")
            }
            Self::OverBudget { total, target } => {
                write!(f, "over budget (${total:.2}/${target:.2})")
            }
            Self::BagOverfilled {
                name,
                quantity,
                max,
            } => write!(f, "too many {name} in one bag ({quantity}, max {max})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub difference: f64,
    pub base_score: f64,
    pub under_budget_bonus: f64,
    pub time_bonus: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub score: f64,
    pub total_price: f64,
    /// Every broken rule, in gate order. Empty for a valid cart.
    pub violations: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

impl ScoreResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn reason(&self) -> String {
        match self.violations.first() {
            Some(violation) => violation.to_string(),
            None => "valid cart".to_string(),
        }
    }

    /// Score rounded to one decimal place for display.
    pub fn display_score(&self) -> String {
        format!("{:.1}", self.score)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScoreError {
    #[error("cart is missing")]
    MissingCart,
    #[error("invalid price for {name:?}")]
    InvalidPrice { name: String },
    #[error("invalid quantity for {name:?}")]
    InvalidQuantity { name: String },
    #[error("time used must be a non-negative number of seconds")]
    InvalidTime,
    #[error("target price must be a positive number")]
    InvalidTarget,
}

/// Scores `cart` with the default rules and the given target price.
pub fn score(
    cart: &[CartLine],
    target_price: f64,
    time_used_seconds: f64,
) -> Result<ScoreResult, ScoreError> {
    GameRules {
        target_price,
        ..GameRules::default()
    }
    .score(cart, time_used_seconds)
}

impl GameRules {
    pub fn score(&self, cart: &[CartLine], time_used_seconds: f64) -> Result<ScoreResult, ScoreError> {
        self.validate(cart, time_used_seconds)?;

        let total_cents: i64 = cart.iter().map(CartLine::subtotal_cents).sum();
        let target_cents = to_cents(self.target_price);
        let total_price = from_cents(total_cents);
        let violations = self.violations(cart, total_cents, target_cents);

        if !violations.is_empty() {
            return Ok(ScoreResult {
                score: 0.0,
                total_price,
                violations,
                breakdown: None,
            });
        }

        let target = self.target_price;
        let difference = from_cents((target_cents - total_cents).abs());
        let base_score = (target - difference).max(0.0);
        let under_budget_bonus = if total_cents <= target_cents {
            self.under_budget_bonus
        } else {
            0.0
        };
        let time_bonus = if time_used_seconds < self.time_bonus_window_secs {
            let seconds_per_point = self.time_bonus_window_secs / self.time_bonus_max;
            (self.time_bonus_max - time_used_seconds / seconds_per_point).max(0.0)
        } else {
            0.0
        };

        Ok(ScoreResult {
            score: base_score + under_budget_bonus + time_bonus,
            total_price,
            violations,
            breakdown: Some(ScoreBreakdown {
                difference,
                base_score,
                under_budget_bonus,
                time_bonus,
            }),
        })
    }

    fn validate(&self, cart: &[CartLine], time_used_seconds: f64) -> Result<(), ScoreError> {
        if !(self.target_price.is_finite() && self.target_price > 0.0) {
            return Err(ScoreError::InvalidTarget);
        }
        if !(time_used_seconds.is_finite() && time_used_seconds >= 0.0) {
            return Err(ScoreError::InvalidTime);
        }

        for line in cart {
            if !(line.price.is_finite() && line.price >= 0.0) {
                return Err(ScoreError::InvalidPrice {
                    name: line.name.clone(),
                });
            }
            if line.quantity == 0 {
                return Err(ScoreError::InvalidQuantity {
                    name: line.name.clone(),
                });
            }
        }

        Ok(())
    }

    fn violations(&self, cart: &[CartLine], total_cents: i64, target_cents: i64) -> Vec<Violation> {
        let mut violations = Vec::new();

        let bags = cart
            .iter()
            .map(|line| line.name.as_str())
            .collect::<HashSet<_>>()
            .len();
        if bags != self.required_bags {
            violations.push(Violation::BagCount {
                found: bags,
                required: self.required_bags,
            });
        }

        if total_cents > target_cents {
            violations.push(Violation::OverBudget {
                total: from_cents(total_cents),
                target: self.target_price,
            });
        }

        violations.extend(
            cart.iter()
                .filter(|line| line.quantity > self.max_per_bag)
                .map(|line| Violation::BagOverfilled {
                    name: line.name.clone(),
                    quantity: line.quantity,
                    max: self.max_per_bag,
                }),
        );

        violations
    }
}
