//! ARIMA(p, d, q) fitted by conditional sum of squares.
//!
//! Estimation starts from a Hannan–Rissanen regression and is refined with a
//! Nelder–Mead search restricted to stationary AR and invertible MA polynomials.
//! A constant is only estimated when `d = 0`.

use crate::error::ForecastError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

pub const MAX_P: usize = 5;
pub const MAX_D: usize = 2;
pub const MAX_Q: usize = 5;

/// Observations needed on top of `p + d + q` before a fit is attempted.
const MIN_EXTRA_OBSERVATIONS: usize = 10;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("need at least {needed} observations for this order, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("series contains non-finite values")]
    NonFinite,

    #[error("least squares regression failed: {0}")]
    Regression(&'static str),

    #[error("confidence level must be in (0, 1), got {0}")]
    InvalidConfidence(f64),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl Default for ArimaOrder {
    fn default() -> Self {
        Self { p: 5, d: 1, q: 5 }
    }
}

impl ArimaOrder {
    pub fn validate(&self) -> Result<(), ForecastError> {
        for (field, value, max) in [("p", self.p, MAX_P), ("d", self.d, MAX_D), ("q", self.q, MAX_Q)] {
            if value > max {
                return Err(ForecastError::OutOfBounds {
                    field,
                    value,
                    min: 0,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Shortest undifferenced series `fit` accepts: at least `p + d + q` plus a
    /// margin, and enough rows left for the Hannan–Rissanen regressions.
    pub fn min_observations(&self) -> usize {
        let mut n = self.p + self.d + self.q + MIN_EXTRA_OBSERVATIONS;
        while !regression_has_rows(n - self.d, self.p, self.q) {
            n += 1;
        }
        n
    }
}

impl std::fmt::Display for ArimaOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.p, self.d, self.q)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastStep {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone)]
pub struct ArimaModel {
    order: ArimaOrder,
    ar: Vec<f64>,
    ma: Vec<f64>,
    /// Mean of the differenced series; zero whenever `d > 0`.
    mean: f64,
    sigma2: f64,
    /// One-step residuals of the differenced series.
    residuals: Vec<f64>,
    history: Vec<f64>,
}

impl ArimaModel {
    pub fn fit(series: &[f64], order: ArimaOrder) -> Result<Self, ModelError> {
        let needed = order.min_observations();
        if series.len() < needed {
            return Err(ModelError::InsufficientData {
                needed,
                got: series.len(),
            });
        }
        if series.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite);
        }

        let differenced = difference(series, order.d);
        let mean = if order.d == 0 {
            differenced.iter().sum::<f64>() / differenced.len() as f64
        } else {
            0.0
        };
        let centred: Vec<f64> = differenced.iter().map(|w| w - mean).collect();

        let mut start = hannan_rissanen(&centred, order.p, order.q)?;
        if !admissible(&start[..order.p], &start[order.p..]) {
            start = vec![0.0; order.p + order.q];
        }

        let params = if start.is_empty() {
            start
        } else {
            let objective = |params: &[f64]| {
                let (ar, ma) = params.split_at(order.p);
                if !admissible(ar, ma) {
                    return f64::INFINITY;
                }
                conditional_sum_of_squares(&centred, ar, ma)
            };
            nelder_mead(objective, &start, 0.1, 200 * (order.p + order.q))
        };

        let (ar, ma) = params.split_at(order.p);
        let residuals = css_residuals(&centred, ar, ma);
        let conditioned = residuals.len() - order.p;
        let sigma2 = residuals[order.p..].iter().map(|e| e * e).sum::<f64>() / conditioned as f64;

        Ok(Self {
            order,
            ar: ar.to_vec(),
            ma: ma.to_vec(),
            mean,
            sigma2,
            residuals,
            history: series.to_vec(),
        })
    }

    pub fn order(&self) -> ArimaOrder {
        self.order
    }

    pub fn ar_coefficients(&self) -> &[f64] {
        &self.ar
    }

    pub fn ma_coefficients(&self) -> &[f64] {
        &self.ma
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    /// One-step-ahead predictions for observations `1..n`. The first observation
    /// has nothing to condition on and is skipped.
    pub fn fitted_values(&self) -> Vec<f64> {
        let d = self.order.d;
        (1..self.history.len())
            .map(|t| {
                if t >= d {
                    self.history[t] - self.residuals[t - d]
                } else {
                    self.history[t - 1]
                }
            })
            .collect()
    }

    /// Point forecasts with a two-sided interval at `confidence` for `steps` periods.
    pub fn forecast(&self, steps: usize, confidence: f64) -> Result<Vec<ForecastStep>, ModelError> {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(ModelError::InvalidConfidence(confidence));
        }
        let z = Normal::new(0.0, 1.0)
            .map_err(|_| ModelError::InvalidConfidence(confidence))?
            .inverse_cdf(1.0 - (1.0 - confidence) / 2.0);

        let levels_ar = self.level_ar_coefficients();
        let constant = if self.order.d == 0 {
            self.mean * (1.0 - self.ar.iter().sum::<f64>())
        } else {
            0.0
        };

        let n = self.history.len();
        let d = self.order.d;
        let shock = |t: usize| -> f64 {
            if t >= d && t < n { self.residuals[t - d] } else { 0.0 }
        };

        let mut levels = self.history.clone();
        let psi = self.psi_weights(&levels_ar, steps);
        let mut cumulative_psi2 = 0.0;
        let mut out = Vec::with_capacity(steps);

        for h in 0..steps {
            let t = n + h;
            let mut value = constant;
            for (i, a) in levels_ar.iter().enumerate() {
                value += a * levels[t - i - 1];
            }
            for (j, theta) in self.ma.iter().enumerate() {
                value += theta * shock(t - j - 1);
            }
            levels.push(value);

            cumulative_psi2 += psi[h] * psi[h];
            let half_width = z * (self.sigma2 * cumulative_psi2).sqrt();
            out.push(ForecastStep {
                mean: value,
                lower: value - half_width,
                upper: value + half_width,
            });
        }

        Ok(out)
    }

    /// AR coefficients of the undifferenced series, i.e. of `phi(B) (1 - B)^d`.
    fn level_ar_coefficients(&self) -> Vec<f64> {
        let mut poly = Vec::with_capacity(self.ar.len() + 1);
        poly.push(1.0);
        poly.extend(self.ar.iter().map(|phi| -phi));
        for _ in 0..self.order.d {
            poly = multiply_polynomials(&poly, &[1.0, -1.0]);
        }
        poly[1..].iter().map(|c| -c).collect()
    }

    fn psi_weights(&self, levels_ar: &[f64], count: usize) -> Vec<f64> {
        let mut psi = Vec::with_capacity(count);
        for j in 0..count {
            let mut value = if j == 0 { 1.0 } else { self.ma.get(j - 1).copied().unwrap_or(0.0) };
            for (i, a) in levels_ar.iter().enumerate().take(j) {
                value += a * psi[j - i - 1];
            }
            psi.push(value);
        }
        psi
    }
}

pub fn difference(series: &[f64], d: usize) -> Vec<f64> {
    let mut out = series.to_vec();
    for _ in 0..d {
        out = out.windows(2).map(|w| w[1] - w[0]).collect();
    }
    out
}

fn multiply_polynomials(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn css_residuals(x: &[f64], ar: &[f64], ma: &[f64]) -> Vec<f64> {
    let mut e = vec![0.0; x.len()];
    for t in 0..x.len() {
        let mut prediction = 0.0;
        for (i, phi) in ar.iter().enumerate().take(t) {
            prediction += phi * x[t - i - 1];
        }
        for (j, theta) in ma.iter().enumerate().take(t) {
            prediction += theta * e[t - j - 1];
        }
        e[t] = x[t] - prediction;
    }
    e
}

fn conditional_sum_of_squares(x: &[f64], ar: &[f64], ma: &[f64]) -> f64 {
    css_residuals(x, ar, ma)[ar.len()..].iter().map(|e| e * e).sum()
}

fn admissible(ar: &[f64], ma: &[f64]) -> bool {
    let negated_ma: Vec<f64> = ma.iter().map(|theta| -theta).collect();
    roots_inside_unit_circle(ar) && roots_inside_unit_circle(&negated_ma)
}

/// True when the recursion `v_t = c_1 v_{t-1} + ... + c_k v_{t-k}` is stable,
/// i.e. every inverse root of `1 - c_1 z - ... - c_k z^k` has modulus below one.
///
/// Schur–Cohn step-down: the recursion is stable iff every reflection
/// coefficient met while lowering the order has modulus below one.
fn roots_inside_unit_circle(coeffs: &[f64]) -> bool {
    const MARGIN: f64 = 1.0 - 1e-6;
    if coeffs.iter().any(|c| !c.is_finite()) {
        return false;
    }

    let mut current = coeffs.to_vec();
    while let Some(&reflection) = current.last() {
        if reflection.abs() >= MARGIN {
            return false;
        }
        let order = current.len();
        let scale = 1.0 - reflection * reflection;
        current = (0..order - 1)
            .map(|i| (current[i] + reflection * current[order - 2 - i]) / scale)
            .collect();
    }
    true
}

fn least_squares(design: DMatrix<f64>, target: DVector<f64>) -> Result<DVector<f64>, ModelError> {
    design.svd(true, true).solve(&target, 1e-10).map_err(ModelError::Regression)
}

/// Order of the long autoregression and the first usable row of the joint
/// regression, for a differenced series of length `m`.
fn regression_lags(m: usize, p: usize, q: usize) -> (usize, usize) {
    if q == 0 {
        return (0, p);
    }
    let long_order = (p + q + 5).min(m / 3).max(1);
    (long_order, p.max(long_order + q))
}

fn regression_has_rows(m: usize, p: usize, q: usize) -> bool {
    let (_, first) = regression_lags(m, p, q);
    m > first + p + q
}

/// Long autoregression for proxy innovations, then a joint regression on lagged
/// values and lagged innovations.
fn hannan_rissanen(x: &[f64], p: usize, q: usize) -> Result<Vec<f64>, ModelError> {
    if p + q == 0 {
        return Ok(Vec::new());
    }
    let m = x.len();
    let (long_order, first) = regression_lags(m, p, q);

    let innovations = if q > 0 {
        let k = long_order;
        let rows = m - k;
        let design = DMatrix::from_fn(rows, k, |r, c| x[r + k - c - 1]);
        let target = DVector::from_fn(rows, |r, _| x[r + k]);
        let long_ar = least_squares(design, target)?;

        let mut e = vec![0.0; m];
        for t in k..m {
            let prediction: f64 = (0..k).map(|i| long_ar[i] * x[t - i - 1]).sum();
            e[t] = x[t] - prediction;
        }
        e
    } else {
        vec![0.0; m]
    };

    let cols = p + q;
    if !regression_has_rows(m, p, q) {
        return Err(ModelError::InsufficientData {
            needed: first + cols + 1,
            got: m,
        });
    }
    let rows = m - first;
    let design = DMatrix::from_fn(rows, cols, |r, c| {
        let t = r + first;
        if c < p { x[t - c - 1] } else { innovations[t - (c - p) - 1] }
    });
    let target = DVector::from_fn(rows, |r, _| x[r + first]);

    Ok(least_squares(design, target)?.iter().copied().collect())
}

/// Derivative-free minimisation; `f` may return infinity for rejected points.
fn nelder_mead<F: Fn(&[f64]) -> f64>(f: F, start: &[f64], step: f64, max_iter: usize) -> Vec<f64> {
    const TOLERANCE: f64 = 1e-10;
    let dim = start.len();

    let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(dim + 1);
    simplex.push((start.to_vec(), f(start)));
    for i in 0..dim {
        let mut vertex = start.to_vec();
        vertex[i] += step;
        let value = f(&vertex);
        simplex.push((vertex, value));
    }

    for _ in 0..max_iter {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[dim].1;
        if best.is_finite() && (worst - best).abs() <= TOLERANCE * (best.abs() + TOLERANCE) {
            break;
        }

        let mut centroid = vec![0.0; dim];
        for (vertex, _) in &simplex[..dim] {
            for (c, v) in centroid.iter_mut().zip(vertex) {
                *c += v / dim as f64;
            }
        }
        let towards = |coef: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&simplex[dim].0)
                .map(|(c, w)| c + coef * (w - c))
                .collect()
        };

        let reflected = towards(-1.0);
        let reflected_value = f(&reflected);

        if reflected_value < simplex[0].1 {
            let expanded = towards(-2.0);
            let expanded_value = f(&expanded);
            simplex[dim] = if expanded_value < reflected_value {
                (expanded, expanded_value)
            } else {
                (reflected, reflected_value)
            };
        } else if reflected_value < simplex[dim - 1].1 {
            simplex[dim] = (reflected, reflected_value);
        } else {
            let contracted = towards(0.5);
            let contracted_value = f(&contracted);
            if contracted_value < simplex[dim].1 {
                simplex[dim] = (contracted, contracted_value);
            } else {
                let anchor = simplex[0].0.clone();
                for (vertex, value) in simplex.iter_mut().skip(1) {
                    for (v, a) in vertex.iter_mut().zip(&anchor) {
                        *v = a + 0.5 * (*v - a);
                    }
                    *value = f(vertex);
                }
            }
        }
    }

    simplex
        .into_iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(vertex, _)| vertex)
        .unwrap_or_else(|| start.to_vec())
}
