//! Dixon-Coles style goal model.
//!
//! Independent Poisson marginals for home and away goals, with the four
//! lowest-score cells rescaled by a correlation parameter ρ. Goal rates are
//! fitted to a target home/draw/away triple by exhaustive grid search.

use serde::{Deserialize, Serialize};

use crate::db::models::ThreeWay;

pub const DEFAULT_RHO: f64 = 0.12;
pub const MAX_GOALS: usize = 8;

/// Bounded search grid for the (home, away) goal-rate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateGrid {
    pub home_min: f64,
    pub home_max: f64,
    pub home_steps: usize,
    pub away_min: f64,
    pub away_max: f64,
    pub away_steps: usize,
}

impl Default for RateGrid {
    fn default() -> Self {
        RateGrid {
            home_min: 0.4,
            home_max: 2.8,
            home_steps: 25,
            away_min: 0.3,
            away_max: 2.4,
            away_steps: 22,
        }
    }
}

impl RateGrid {
    /// Same bounds with every interval halved; contains all points of `self`.
    pub fn refined(&self) -> Self {
        RateGrid {
            home_steps: self.home_steps.max(2) * 2 - 1,
            away_steps: self.away_steps.max(2) * 2 - 1,
            ..*self
        }
    }

    fn home_rates(&self) -> impl Iterator<Item = f64> {
        linspace(self.home_min, self.home_max, self.home_steps)
    }

    fn away_rates(&self) -> impl Iterator<Item = f64> {
        linspace(self.away_min, self.away_max, self.away_steps)
    }
}

fn linspace(lo: f64, hi: f64, steps: usize) -> impl Iterator<Item = f64> {
    let steps = steps.max(1);
    let step = if steps > 1 {
        (hi - lo) / (steps - 1) as f64
    } else {
        0.0
    };
    (0..steps).map(move |i| lo + i as f64 * step)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreModelConfig {
    pub rho: f64,
    pub max_goals: usize,
    pub grid: RateGrid,
    /// Number of exact scores to report
    pub top_k: usize,
    /// Totals lines for which over-probabilities are derived
    pub totals_lines: Vec<f64>,
    /// Fits with a higher loss are flagged as degenerate (never rejected)
    pub degenerate_loss: f64,
}

impl Default for ScoreModelConfig {
    fn default() -> Self {
        ScoreModelConfig {
            rho: DEFAULT_RHO,
            max_goals: MAX_GOALS,
            grid: RateGrid::default(),
            top_k: 3,
            totals_lines: vec![2.5],
            degenerate_loss: 5e-3,
        }
    }
}

/// Joint probability of (home goals, away goals), row-major by home goals.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalMatrix {
    size: usize,
    cells: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreProbability {
    pub home_goals: usize,
    pub away_goals: usize,
    pub probability: f64,
}

fn poisson_pmf(rate: f64, max_goals: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(max_goals + 1);
    let mut p = (-rate).exp();
    out.push(p);
    for k in 1..=max_goals {
        p *= rate / k as f64;
        out.push(p);
    }
    out
}

/// Build the corrected, renormalised goal matrix for a rate pair.
pub fn goal_matrix(home_rate: f64, away_rate: f64, rho: f64, max_goals: usize) -> GoalMatrix {
    let max_goals = max_goals.max(1);
    let size = max_goals + 1;
    let px = poisson_pmf(home_rate, max_goals);
    let py = poisson_pmf(away_rate, max_goals);

    let mut cells = Vec::with_capacity(size * size);
    for h in &px {
        for a in &py {
            cells.push(h * a);
        }
    }

    // Low-score correction; factors floored at zero so every cell stays a probability.
    let factor = |f: f64| f.max(0.0);
    cells[0] *= factor(1.0 - home_rate * rho - away_rate * rho + rho);
    cells[1] *= factor(1.0 + home_rate * rho);
    cells[size] *= factor(1.0 + away_rate * rho);
    cells[size + 1] *= factor(1.0 - rho);

    let total: f64 = cells.iter().sum();
    if total > 0.0 {
        for c in cells.iter_mut() {
            *c /= total;
        }
    }
    GoalMatrix { size, cells }
}

impl GoalMatrix {
    pub fn get(&self, home_goals: usize, away_goals: usize) -> f64 {
        self.cells[home_goals * self.size + away_goals]
    }

    pub fn total(&self) -> f64 {
        self.cells.iter().sum()
    }

    fn indexed(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .map(move |(idx, p)| (idx / self.size, idx % self.size, *p))
    }

    /// Home win / draw / away win probabilities.
    pub fn hda(&self) -> ThreeWay {
        let mut out = ThreeWay::default();
        for (h, a, p) in self.indexed() {
            if h > a {
                out.home += p;
            } else if h == a {
                out.draw += p;
            } else {
                out.away += p;
            }
        }
        out
    }

    /// Probability that total goals exceed `line`.
    pub fn over_probability(&self, line: f64) -> f64 {
        self.indexed()
            .filter(|(h, a, _)| (h + a) as f64 > line)
            .map(|(_, _, p)| p)
            .sum()
    }

    /// Most probable exact scores. Ties keep row-major score order.
    pub fn top_scores(&self, k: usize) -> Vec<ScoreProbability> {
        let mut scores: Vec<ScoreProbability> = self
            .indexed()
            .map(|(h, a, p)| ScoreProbability {
                home_goals: h,
                away_goals: a,
                probability: p,
            })
            .collect();
        scores.sort_by(|x, y| y.probability.total_cmp(&x.probability));
        scores.truncate(k);
        scores
    }

    /// Expected (home, away) goals.
    pub fn expected_goals(&self) -> (f64, f64) {
        self.indexed().fold((0.0, 0.0), |(eh, ea), (h, a, p)| {
            (eh + h as f64 * p, ea + a as f64 * p)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub home_rate: f64,
    pub away_rate: f64,
    /// Squared deviation of the fitted triple from the target
    pub loss: f64,
}

/// Grid-search the rate pair whose derived H/D/A best matches `target`.
///
/// Always returns a pair, however poor the fit.
pub fn calibrate_rates(target: ThreeWay, rho: f64, max_goals: usize, grid: &RateGrid) -> Calibration {
    let mut best = Calibration {
        home_rate: 1.4,
        away_rate: 1.1,
        loss: f64::INFINITY,
    };
    for home_rate in grid.home_rates() {
        for away_rate in grid.away_rates() {
            let hda = goal_matrix(home_rate, away_rate, rho, max_goals).hda();
            let loss = hda.squared_error(&target);
            if loss < best.loss {
                best = Calibration {
                    home_rate,
                    away_rate,
                    loss,
                };
            }
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreModelResult {
    pub calibration: Calibration,
    pub degenerate: bool,
    pub hda: ThreeWay,
    /// Expected (home, away) goals
    pub expected_goals: (f64, f64),
    pub top_scores: Vec<ScoreProbability>,
    /// (line, P(total > line)) per configured line
    pub totals_over: Vec<(f64, f64)>,
}

impl ScoreModelResult {
    pub fn over(&self, line: f64) -> Option<f64> {
        self.totals_over
            .iter()
            .find(|(l, _)| (l - line).abs() < 0.005)
            .map(|(_, p)| *p)
    }

    pub fn expected_score(&self) -> String {
        format!("{:.2}-{:.2}", self.expected_goals.0, self.expected_goals.1)
    }
}

/// Fit the model to a consensus triple and derive everything downstream needs.
pub fn summarize(target: ThreeWay, config: &ScoreModelConfig) -> ScoreModelResult {
    let calibration = calibrate_rates(target, config.rho, config.max_goals, &config.grid);
    let matrix = goal_matrix(
        calibration.home_rate,
        calibration.away_rate,
        config.rho,
        config.max_goals,
    );
    ScoreModelResult {
        calibration,
        degenerate: !(calibration.loss <= config.degenerate_loss),
        hda: matrix.hda(),
        expected_goals: matrix.expected_goals(),
        top_scores: matrix.top_scores(config.top_k),
        totals_over: config
            .totals_lines
            .iter()
            .map(|line| (*line, matrix.over_probability(*line)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn matrix_sums_to_one() {
        let m = goal_matrix(1.4, 1.1, 0.12, 8);
        assert_relative_eq!(m.total(), 1.0, epsilon = 1e-9);
        let hda = m.hda();
        assert_relative_eq!(hda.sum(), 1.0, epsilon = 1e-9);
        assert!(hda.home > hda.away);
    }

    #[test]
    fn matrix_sums_to_one_across_rates_and_rho() {
        for &lh in &[0.05, 0.4, 1.0, 2.8, 4.5] {
            for &la in &[0.05, 0.3, 1.2, 2.4, 4.0] {
                for &rho in &[0.0, 0.12, 0.5, 0.95] {
                    let m = goal_matrix(lh, la, rho, 8);
                    assert_relative_eq!(m.total(), 1.0, epsilon = 1e-9);
                    assert!(m.cells.iter().all(|p| *p >= 0.0));
                }
            }
        }
    }

    #[test]
    fn calibration_fits_typical_triple() {
        let target = ThreeWay::new(0.45, 0.27, 0.28);
        let fit = calibrate_rates(target, 0.12, 8, &RateGrid::default());
        assert!(fit.loss < 1e-3, "loss {}", fit.loss);
        assert!(fit.home_rate > fit.away_rate);
    }

    #[test]
    fn finer_grid_never_increases_loss() {
        for target in [
            ThreeWay::new(0.45, 0.27, 0.28),
            ThreeWay::new(0.62, 0.22, 0.16),
            ThreeWay::new(0.20, 0.25, 0.55),
        ] {
            let coarse = RateGrid::default();
            let fine = coarse.refined();
            let l1 = calibrate_rates(target, 0.12, 8, &coarse).loss;
            let l2 = calibrate_rates(target, 0.12, 8, &fine).loss;
            let l3 = calibrate_rates(target, 0.12, 8, &fine.refined()).loss;
            assert!(l2 <= l1 + 1e-12);
            assert!(l3 <= l2 + 1e-12);
        }
    }

    #[test]
    fn poor_fit_still_returns_parameters() {
        let cfg = ScoreModelConfig::default();
        let res = summarize(ThreeWay::new(0.97, 0.02, 0.01), &cfg);
        assert!(res.degenerate);
        assert!(res.calibration.home_rate.is_finite());
        assert_relative_eq!(res.hda.sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn top_scores_are_sorted_and_deterministic() {
        let m = goal_matrix(1.4, 1.1, 0.12, 8);
        let top = m.top_scores(4);
        assert_eq!(top.len(), 4);
        assert_eq!((top[0].home_goals, top[0].away_goals), (1, 0));
        assert!(top.windows(2).all(|w| w[0].probability >= w[1].probability));

        // Symmetric rates with no correction: 0-1 and 1-0 tie, row-major order wins.
        let sym = goal_matrix(1.0, 1.0, 0.0, 8);
        let top = sym.top_scores(4);
        let order: Vec<(usize, usize)> = top.iter().map(|s| (s.home_goals, s.away_goals)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn expected_goals_and_totals() {
        let m = goal_matrix(1.4, 1.1, 0.0, 8);
        let (eh, ea) = m.expected_goals();
        // Truncation at 8 goals loses almost nothing at these rates.
        assert_relative_eq!(eh, 1.4, epsilon = 1e-3);
        assert_relative_eq!(ea, 1.1, epsilon = 1e-3);
        let over = m.over_probability(2.5);
        assert!(over > 0.4 && over < 0.5, "over 2.5 = {}", over);
        assert_relative_eq!(m.over_probability(-1.0), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn summarize_reports_configured_lines() {
        let cfg = ScoreModelConfig {
            totals_lines: vec![1.5, 2.5, 3.5],
            ..ScoreModelConfig::default()
        };
        let res = summarize(ThreeWay::new(0.45, 0.27, 0.28), &cfg);
        assert!(!res.degenerate);
        assert_eq!(res.top_scores.len(), 3);
        let o15 = res.over(1.5).unwrap();
        let o25 = res.over(2.5).unwrap();
        let o35 = res.over(3.5).unwrap();
        assert!(o15 > o25 && o25 > o35);
        assert_eq!(res.over(4.5), None);
        assert_eq!(res.expected_score().len(), 9);
    }
}
