//! Edge, expected value and Kelly stake sizing for decimal prices.
//!
//! Standard Kelly formula:
//!   f* = (b·p − q) / b
//! where
//!   b  = net odds received on the bet (decimal price − 1)
//!   p  = estimated probability of winning
//!   q  = 1 − p  (probability of losing)
//!
//! We apply a *fractional* Kelly multiplier to reduce variance at the cost of
//! slightly lower expected growth.

pub use super::consensus::implied_probability;

/// Model probability minus the price-implied probability.
pub fn edge(win_prob: f64, decimal_odds: f64) -> f64 {
    win_prob - implied_probability(decimal_odds)
}

/// Expected fractional return per unit staked.
pub fn expected_value(win_prob: f64, decimal_odds: f64) -> f64 {
    win_prob * decimal_odds - 1.0
}

/// Fraction of bankroll to stake.
///
/// Returns `0.0` for any degenerate input: `decimal_odds <= 1`, `win_prob`
/// outside (0, 1), a non-finite or negative multiplier, or no edge.
pub fn fractional_kelly(win_prob: f64, decimal_odds: f64, fraction: f64) -> f64 {
    let b = decimal_odds - 1.0;
    let p = win_prob;
    if !(b > 0.0) || !(p > 0.0 && p < 1.0) || !b.is_finite() || !(fraction >= 0.0) {
        return 0.0;
    }
    let q = 1.0 - p;
    let f = (b * p - q) / b;
    (fraction * f).max(0.0)
}

/// Round a monetary amount to cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Monetary stake for a bet against the current bankroll.
pub fn stake_amount(bankroll: f64, win_prob: f64, decimal_odds: f64, kelly_fraction: f64) -> f64 {
    if !(bankroll > 0.0) {
        return 0.0;
    }
    round_cents(bankroll * fractional_kelly(win_prob, decimal_odds, kelly_fraction))
}
