use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::{
    config::CoxConfig,
    data::SurvivalData,
    error::{Result, SurvivalError},
    linalg,
};

/// How tied event times enter the partial likelihood
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieMethod {
    /// Efron's approximation, deaths at a tied time leave the risk set gradually
    #[default]
    Efron,
    /// Breslow's approximation, every tied death sees the full risk set
    Breslow,
}

/// Configuration for Newton-Raphson fitting
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub ties: TieMethod,
    pub max_iterations: usize,
    pub tolerance: f64,        // on max |beta step|
    pub max_step_halvings: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self::from(&CoxConfig::default())
    }
}

impl From<&CoxConfig> for OptimizationConfig {
    fn from(config: &CoxConfig) -> Self {
        Self {
            ties: config.ties,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            max_step_halvings: config.max_step_halvings,
        }
    }
}

/// Log partial likelihood with its gradient and observed information (minus Hessian)
#[derive(Debug, Clone)]
pub struct Derivatives {
    pub loglik: f64,
    pub gradient: Array1<f64>,
    pub information: Array2<f64>,
}

/// What Newton-Raphson hands back to the model
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub beta: Array1<f64>,
    pub at_beta: Derivatives,
    pub at_zero: Derivatives,
    pub iterations: usize,
}

/// Risk-set sums at one distinct event time of one stratum.
///
/// `s*` run over everyone still at risk, `e*` over the subjects dying at `time`.
/// Weights are `exp(eta - max eta)`.
pub(crate) struct EventGroup<'a> {
    pub time: f64,
    pub stratum: usize,
    pub deaths: &'a [usize],
    pub s0: f64,
    pub s1: &'a Array1<f64>,
    pub s2: &'a Array2<f64>,
    pub e0: f64,
    pub e1: &'a Array1<f64>,
    pub e2: &'a Array2<f64>,
}

impl EventGroup<'_> {
    /// Efron/Breslow sub-step `l` of the tied deaths: (phi, mean, variance)
    pub fn moments(&self, l: usize, ties: TieMethod) -> Result<(f64, Array1<f64>, Array2<f64>)> {
        let d = self.deaths.len() as f64;
        let f = match ties {
            TieMethod::Efron => l as f64 / d,
            TieMethod::Breslow => 0.0,
        };

        let phi = self.s0 - f * self.e0;
        if !(phi > 0.0) || !phi.is_finite() {
            return Err(SurvivalError::numerical_error(format!(
                "risk set weight is {phi} at time {}",
                self.time
            )));
        }

        let mean = (self.s1 - &(f * self.e1)) / phi;
        let mut variance = (self.s2 - &(f * self.e2)) / phi;
        let p = mean.len();
        for j in 0..p {
            for k in 0..p {
                variance[[j, k]] -= mean[j] * mean[k];
            }
        }
        Ok((phi, mean, variance))
    }
}

/// Walk every stratum from the latest time backwards, growing the risk set,
/// and hand each distinct event time to `visit`.
pub(crate) fn walk_event_groups<F>(
    data: &SurvivalData,
    x: ArrayView2<f64>,
    weights: &[f64],
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&EventGroup<'_>) -> Result<()>,
{
    let p = x.ncols();
    let times = data.times();
    let events = data.events();

    for stratum in 0..data.n_strata() {
        let order = data.stratum_order(stratum);
        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut s2 = Array2::<f64>::zeros((p, p));
        let mut deaths = Vec::new();

        let mut start = 0;
        while start < order.len() {
            let time = times[order[start]];
            let mut end = start;
            while end < order.len() && times[order[end]] == time {
                end += 1;
            }

            deaths.clear();
            let mut e0 = 0.0;
            let mut e1 = Array1::<f64>::zeros(p);
            let mut e2 = Array2::<f64>::zeros((p, p));

            for &i in &order[start..end] {
                let w = weights[i];
                let xi = x.row(i);
                s0 += w;
                add_weighted(&mut s1, &mut s2, w, xi);
                if events[i] {
                    deaths.push(i);
                    e0 += w;
                    add_weighted(&mut e1, &mut e2, w, xi);
                }
            }

            if !deaths.is_empty() {
                visit(&EventGroup {
                    time,
                    stratum,
                    deaths: &deaths,
                    s0,
                    s1: &s1,
                    s2: &s2,
                    e0,
                    e1: &e1,
                    e2: &e2,
                })?;
            }
            start = end;
        }
    }

    Ok(())
}

fn add_weighted(sum1: &mut Array1<f64>, sum2: &mut Array2<f64>, w: f64, xi: ArrayView1<f64>) {
    let p = xi.len();
    for j in 0..p {
        sum1[j] += w * xi[j];
        for k in 0..p {
            sum2[[j, k]] += w * xi[j] * xi[k];
        }
    }
}

/// linear predictor and stabilised risk weights exp(eta - max eta)
pub(crate) fn risk_weights(x: ArrayView2<f64>, beta: &Array1<f64>) -> (Array1<f64>, Vec<f64>) {
    let eta = x.dot(beta);
    let max = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let max = if max.is_finite() { max } else { 0.0 };
    let weights = eta.iter().map(|e| (e - max).exp()).collect();
    (eta.mapv(|e| e - max), weights)
}

/// Log partial likelihood and derivatives at `beta`
pub fn compute_derivatives(
    data: &SurvivalData,
    x: ArrayView2<f64>,
    beta: &Array1<f64>,
    ties: TieMethod,
) -> Result<Derivatives> {
    let p = x.ncols();
    let (eta, weights) = risk_weights(x, beta);

    let mut loglik = 0.0;
    let mut gradient = Array1::zeros(p);
    let mut information = Array2::zeros((p, p));

    walk_event_groups(data, x, &weights, |group| {
        for &i in group.deaths {
            loglik += eta[i];
            gradient += &x.row(i);
        }
        for l in 0..group.deaths.len() {
            let (phi, mean, variance) = group.moments(l, ties)?;
            loglik -= phi.ln();
            gradient -= &mean;
            information += &variance;
        }
        Ok(())
    })?;

    Ok(Derivatives { loglik, gradient, information })
}

pub struct CoxOptimizer {
    config: OptimizationConfig,
}

impl CoxOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    /// Newton-Raphson from beta = 0 with step halving.
    ///
    /// Converged once the largest coefficient step is below the tolerance; hitting
    /// the iteration cap is a `ConvergenceFailure`.
    pub fn optimize(&self, data: &SurvivalData) -> Result<FitOutcome> {
        let x = data.centred_covariates();
        let ties = self.config.ties;
        let mut beta = Array1::zeros(data.n_features());

        let at_zero = compute_derivatives(data, x.view(), &beta, ties)?;
        let mut current = at_zero.clone();
        let mut last_step = f64::INFINITY;

        for iteration in 1..=self.config.max_iterations {
            // information collapsing mid-run means a coefficient is drifting to infinity
            let mut step = linalg::solve(current.information.view(), current.gradient.view())
                .map_err(|_| SurvivalError::ConvergenceFailure { iterations: iteration, last_step })?;
            let floor = current.loglik - 1e-10 * current.loglik.abs().max(1.0);

            let mut halvings = 0;
            let (candidate, next) = loop {
                let candidate = &beta + &step;
                match compute_derivatives(data, x.view(), &candidate, ties) {
                    Ok(next) if next.loglik.is_finite() && next.loglik >= floor => break (candidate, next),
                    _ if halvings < self.config.max_step_halvings => {
                        halvings += 1;
                        step /= 2.0;
                    }
                    Ok(_) => {
                        return Err(SurvivalError::numerical_error(format!(
                            "step halving failed to improve the likelihood at iteration {iteration}"
                        )));
                    }
                    Err(e) => return Err(e),
                }
            };

            last_step = step.iter().fold(0.0_f64, |m, s| m.max(s.abs()));
            debug!(
                "newton-raphson iteration {iteration}: loglik {:.6}, max step {last_step:.3e}, halvings {halvings}",
                next.loglik
            );

            beta = candidate;
            current = next;

            if last_step < self.config.tolerance {
                return Ok(FitOutcome { beta, at_beta: current, at_zero, iterations: iteration });
            }
        }

        Err(SurvivalError::ConvergenceFailure {
            iterations: self.config.max_iterations,
            last_step,
        })
    }
}
