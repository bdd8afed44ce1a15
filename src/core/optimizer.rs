// MAP estimation for the saturating-growth model.
// Analytic gradient, argmin L-BFGS with a steepest-descent fallback.

use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::gradientdescent::SteepestDescent;
use argmin::solver::linesearch::condition::ArmijoCondition;
use argmin::solver::linesearch::{BacktrackingLineSearch, MoreThuenteLineSearch};
use argmin::solver::quasinewton::LBFGS;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::model::GrowthType;
use super::trend::{logistic_init, ols_linear_trend, sigmoid};
use crate::{BirdcastError, Result};

/// Smoothing constant of the Laplace prior: |δ| ≈ sqrt(δ² + ε).
const LAPLACE_EPS: f64 = 1e-6;
/// Floor added to exp(log σ).
const SIGMA_FLOOR: f64 = 1e-3;
/// Prior scale of k and m.
const TREND_PRIOR_SCALE: f64 = 5.0;
/// Prior scale of the half-normal on σ.
const SIGMA_PRIOR_SCALE: f64 = 0.5;

/// Observed data and hyperparameters of one fit, in scaled units.
#[derive(Debug, Clone)]
pub struct SeriesModel {
    pub growth: GrowthType,
    pub t: Vec<f64>,          // Time values (scaled to [0, 1])
    pub y: Vec<f64>,          // Scaled targets, all finite
    pub cap: Vec<f64>,        // Scaled capacity, ignored for linear growth
    pub hinge: Array2<f64>,   // max(t - t_change, 0), n x s
    pub x: Array2<f64>,       // Seasonal features, n x k
    pub sigmas: Vec<f64>,     // Prior scales for seasonal coefficients
    pub tau: f64,             // Changepoint prior scale
}

impl SeriesModel {
    pub fn n(&self) -> usize {
        self.t.len()
    }

    /// Number of changepoints
    pub fn s(&self) -> usize {
        self.hinge.ncols()
    }

    /// Number of seasonal features
    pub fn k(&self) -> usize {
        self.x.ncols()
    }

    pub fn num_params(&self) -> usize {
        ModelParams::num_params(self.s(), self.k())
    }

    /// Trend value and d(trend)/du at every row.
    fn trend_terms(&self, p: &ModelParams) -> (Vec<f64>, Vec<f64>) {
        let n = self.n();
        let mut g = Vec::with_capacity(n);
        let mut dg = Vec::with_capacity(n);
        for i in 0..n {
            let mut u = p.k * self.t[i] + p.m;
            for (j, d) in p.delta.iter().enumerate() {
                u += self.hinge[[i, j]] * d;
            }
            match self.growth {
                GrowthType::Logistic => {
                    let s = sigmoid(u);
                    g.push(self.cap[i] * s);
                    dg.push(self.cap[i] * s * (1.0 - s));
                }
                GrowthType::Linear => {
                    g.push(u);
                    dg.push(1.0);
                }
            }
        }
        (g, dg)
    }

    fn residuals(&self, p: &ModelParams, g: &[f64]) -> Vec<f64> {
        (0..self.n())
            .map(|i| {
                let mut seas = 0.0;
                for (l, b) in p.beta.iter().enumerate() {
                    seas += self.x[[i, l]] * b;
                }
                self.y[i] - g[i] - seas
            })
            .collect()
    }

    /// Negative log posterior (up to a constant).
    pub fn neg_log_prob(&self, params: &[f64]) -> f64 {
        let p = ModelParams::from_vec(params, self.s(), self.k());
        let (g, _) = self.trend_terms(&p);
        let r = self.residuals(&p, &g);
        let sigma = p.sigma_obs;
        let n = self.n() as f64;

        let ssr: f64 = r.iter().map(|v| v * v).sum();
        let mut cost = ssr / (2.0 * sigma * sigma) + n * sigma.ln();

        let trend_var = TREND_PRIOR_SCALE * TREND_PRIOR_SCALE;
        cost += p.k * p.k / (2.0 * trend_var) + p.m * p.m / (2.0 * trend_var);
        cost += p
            .delta
            .iter()
            .map(|d| (d * d + LAPLACE_EPS).sqrt() / self.tau)
            .sum::<f64>();
        cost += p
            .beta
            .iter()
            .zip(&self.sigmas)
            .map(|(b, s)| b * b / (2.0 * s * s))
            .sum::<f64>();
        cost += sigma * sigma / (2.0 * SIGMA_PRIOR_SCALE * SIGMA_PRIOR_SCALE);

        if cost.is_finite() {
            cost
        } else {
            f64::INFINITY
        }
    }

    /// Analytic gradient of [`neg_log_prob`](Self::neg_log_prob).
    pub fn gradient(&self, params: &[f64]) -> Vec<f64> {
        let s = self.s();
        let k = self.k();
        let p = ModelParams::from_vec(params, s, k);
        let (g, dg) = self.trend_terms(&p);
        let r = self.residuals(&p, &g);
        let sigma = p.sigma_obs;
        let var = sigma * sigma;
        let n = self.n() as f64;
        let trend_var = TREND_PRIOR_SCALE * TREND_PRIOR_SCALE;

        let mut grad = vec![0.0; params.len()];
        let mut ssr = 0.0;
        for i in 0..self.n() {
            let e = -r[i] / var;
            let ed = e * dg[i];
            grad[0] += ed * self.t[i];
            grad[1] += ed;
            for j in 0..s {
                grad[2 + j] += ed * self.hinge[[i, j]];
            }
            for l in 0..k {
                grad[3 + s + l] += e * self.x[[i, l]];
            }
            ssr += r[i] * r[i];
        }

        grad[0] += p.k / trend_var;
        grad[1] += p.m / trend_var;
        for (j, d) in p.delta.iter().enumerate() {
            grad[2 + j] += d / (self.tau * (d * d + LAPLACE_EPS).sqrt());
        }
        let d_sigma = -ssr / (var * sigma)
            + n / sigma
            + sigma / (SIGMA_PRIOR_SCALE * SIGMA_PRIOR_SCALE);
        grad[2 + s] = d_sigma * (sigma - SIGMA_FLOOR);
        for (l, b) in p.beta.iter().enumerate() {
            grad[3 + s + l] += b / (self.sigmas[l] * self.sigmas[l]);
        }
        grad
    }

    /// Starting point: trend through the first and last observation, zero
    /// changepoint and seasonal effects, σ from the spread of y.
    pub fn initialize_params(&self) -> Vec<f64> {
        let (k, m) = match self.growth {
            GrowthType::Logistic => logistic_init(&self.t, &self.y, &self.cap),
            GrowthType::Linear => ols_linear_trend(&self.t, &self.y),
        };
        let n = self.n().max(1) as f64;
        let mean = self.y.iter().sum::<f64>() / n;
        let std = (self.y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        let sigma = if std > SIGMA_FLOOR { std } else { 0.1 };

        ModelParams {
            k,
            m,
            delta: vec![0.0; self.s()],
            sigma_obs: sigma,
            beta: vec![0.0; self.k()],
        }
        .to_vec()
    }
}

/// Parameters of the model. `sigma_obs` is stored on its natural scale and
/// optimised as `log(sigma_obs - floor)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub k: f64,             // Base growth rate
    pub m: f64,             // Offset parameter
    pub delta: Vec<f64>,    // Changepoint rate adjustments
    pub sigma_obs: f64,     // Observation noise standard deviation
    pub beta: Vec<f64>,     // Seasonality coefficients
}

impl ModelParams {
    /// Convert parameters to flat vector for optimization
    pub fn to_vec(&self) -> Vec<f64> {
        let mut v = vec![self.k, self.m];
        v.extend(self.delta.iter());
        v.push((self.sigma_obs - SIGMA_FLOOR).max(1e-12).ln());
        v.extend(self.beta.iter());
        v
    }

    /// Create parameters from flat vector
    pub fn from_vec(v: &[f64], s: usize, k: usize) -> Self {
        let mut idx = 0;
        let k_val = v[idx];
        idx += 1;
        let m_val = v[idx];
        idx += 1;
        let delta = v[idx..idx + s].to_vec();
        idx += s;
        let sigma_obs = v[idx].exp() + SIGMA_FLOOR;
        idx += 1;
        let beta = v[idx..idx + k].to_vec();

        Self {
            k: k_val,
            m: m_val,
            delta,
            sigma_obs,
            beta,
        }
    }

    pub fn num_params(s: usize, k: usize) -> usize {
        2 + s + 1 + k // k, m, delta[s], log sigma, beta[k]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub max_iters: u64,
    pub history_size: usize, // For L-BFGS
    pub tolerance_grad: f64,
    pub tolerance_cost: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_iters: 1_000,
            history_size: 5,
            tolerance_grad: 1e-8,
            tolerance_cost: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    Lbfgs,
    SteepestDescent,
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub params: ModelParams,
    pub neg_log_prob: f64,
    pub iterations: u64,
    pub converged: bool,
    pub solver: Solver,
}

struct MapProblem<'a> {
    model: &'a SeriesModel,
}

impl CostFunction for MapProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        Ok(self.model.neg_log_prob(params))
    }
}

impl Gradient for MapProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        Ok(self.model.gradient(params))
    }
}

/// (best param, best cost, iterations)
type RawResult = (Vec<f64>, f64, u64);

fn run_lbfgs(
    model: &SeriesModel,
    init: Vec<f64>,
    config: &OptimizationConfig,
) -> std::result::Result<RawResult, ArgminError> {
    let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
    let solver = LBFGS::new(linesearch, config.history_size)
        .with_tolerance_grad(config.tolerance_grad)?
        .with_tolerance_cost(config.tolerance_cost)?;

    let res = Executor::new(MapProblem { model }, solver)
        .configure(|state| state.param(init).max_iters(config.max_iters))
        .run()?;

    let state = res.state();
    let best = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| ArgminError::msg("L-BFGS returned no parameters"))?;
    Ok((best, state.get_best_cost(), state.get_iter()))
}

fn run_steepest_descent(
    model: &SeriesModel,
    init: Vec<f64>,
    config: &OptimizationConfig,
) -> std::result::Result<RawResult, ArgminError> {
    let linesearch = BacktrackingLineSearch::new(ArmijoCondition::new(1e-4)?).rho(0.5)?;
    let solver = SteepestDescent::new(linesearch);

    let res = Executor::new(MapProblem { model }, solver)
        .configure(|state| state.param(init).max_iters(config.max_iters))
        .run()?;

    let state = res.state();
    let best = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| ArgminError::msg("steepest descent returned no parameters"))?;
    Ok((best, state.get_best_cost(), state.get_iter()))
}

/// Minimise the negative log posterior starting from `init`.
///
/// L-BFGS runs first; if it errors (typically a failed line search on a flat
/// or badly scaled surface) the fit is retried with steepest descent.
pub fn optimize(
    model: &SeriesModel,
    init: Vec<f64>,
    config: &OptimizationConfig,
) -> Result<OptimizationResult> {
    if init.len() != model.num_params() {
        return Err(BirdcastError::Optimization(format!(
            "expected {} initial parameters, got {}",
            model.num_params(),
            init.len()
        )));
    }

    let (raw, solver) = match run_lbfgs(model, init.clone(), config) {
        Ok(raw) => (raw, Solver::Lbfgs),
        Err(e) => {
            warn!(error = %e, "L-BFGS failed, retrying with steepest descent");
            let raw = run_steepest_descent(model, init, config)
                .map_err(|e| BirdcastError::Optimization(e.to_string()))?;
            (raw, Solver::SteepestDescent)
        }
    };

    let (best, cost, iterations) = raw;
    if !cost.is_finite() || best.iter().any(|v| !v.is_finite()) {
        return Err(BirdcastError::Optimization(
            "optimizer did not reach a finite objective".to_string(),
        ));
    }
    debug!(?solver, iterations, cost, "optimization finished");

    Ok(OptimizationResult {
        params: ModelParams::from_vec(&best, model.s(), model.k()),
        neg_log_prob: cost,
        iterations,
        converged: iterations < config.max_iters,
        solver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trend::hinge_matrix;

    fn toy_model(growth: GrowthType) -> SeriesModel {
        let n = 40;
        let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
        let y: Vec<f64> = t
            .iter()
            .map(|&ti| 0.8 * sigmoid(6.0 * ti - 3.0) + 0.02 * (20.0 * ti).sin())
            .collect();
        let t_change = vec![0.25, 0.5];
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                (6.0 * t[i]).sin()
            } else {
                (6.0 * t[i]).cos()
            }
        });
        SeriesModel {
            growth,
            hinge: hinge_matrix(&t, &t_change),
            t,
            y,
            cap: vec![1.0; n],
            x,
            sigmas: vec![10.0, 10.0],
            tau: 0.5,
        }
    }

    #[test]
    fn test_optimization_config_default() {
        let config = OptimizationConfig::default();
        assert_eq!(config.max_iters, 1_000);
        assert_eq!(config.history_size, 5);
    }

    #[test]
    fn test_params_vec_round_trip() {
        let p = ModelParams {
            k: 1.5,
            m: -0.5,
            delta: vec![0.1, 0.2],
            sigma_obs: 0.3,
            beta: vec![0.4],
        };
        let v = p.to_vec();
        assert_eq!(v.len(), ModelParams::num_params(2, 1));
        let back = ModelParams::from_vec(&v, 2, 1);
        assert!((back.sigma_obs - 0.3).abs() < 1e-12);
        assert_eq!(back.delta, p.delta);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        for growth in [GrowthType::Logistic, GrowthType::Linear] {
            let model = toy_model(growth);
            let params = vec![1.2, -0.7, 0.3, -0.4, -1.5, 0.05, -0.02];
            let grad = model.gradient(&params);
            let h = 1e-6;
            for i in 0..params.len() {
                let mut plus = params.clone();
                let mut minus = params.clone();
                plus[i] += h;
                minus[i] -= h;
                let fd = (model.neg_log_prob(&plus) - model.neg_log_prob(&minus)) / (2.0 * h);
                let tol = 1e-4 * fd.abs().max(1.0);
                assert!(
                    (grad[i] - fd).abs() < tol,
                    "{:?} param {}: analytic {} vs numeric {}",
                    growth,
                    i,
                    grad[i],
                    fd
                );
            }
        }
    }

    #[test]
    fn test_optimize_reduces_cost() {
        let model = toy_model(GrowthType::Logistic);
        let init = model.initialize_params();
        let start = model.neg_log_prob(&init);
        let result = optimize(&model, init, &OptimizationConfig::default()).unwrap();
        assert!(result.neg_log_prob <= start);
        assert!(result.params.sigma_obs > 0.0);
        assert_eq!(result.params.delta.len(), 2);
    }

    #[test]
    fn test_optimize_rejects_wrong_length() {
        let model = toy_model(GrowthType::Linear);
        let err = optimize(&model, vec![0.0; 3], &OptimizationConfig::default());
        assert!(matches!(err, Err(BirdcastError::Optimization(_))));
    }
}
