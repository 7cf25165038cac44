use log::warn;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SurvivalError},
    metrics,
    model::CoxFit,
};

/// What to do when some imputed datasets fail to fit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// first failure is returned, nothing is pooled
    #[default]
    Abort,
    /// failed fits are logged and dropped; at least two must remain
    ExcludeFailed,
}

/// point estimate and sampling covariance from one completed dataset
#[derive(Debug, Clone)]
pub struct ImputationEstimate {
    pub terms: Vec<String>,
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
    /// complete-data degrees of freedom (events minus parameters for a Cox fit)
    pub df_complete: f64,
}

impl From<&CoxFit> for ImputationEstimate {
    fn from(fit: &CoxFit) -> Self {
        let p = fit.coefficients().len();
        Self {
            terms: fit.term_names(),
            coefficients: fit.coefficients().clone(),
            covariance: fit.covariance().clone(),
            df_complete: (fit.n_events() as f64 - p as f64).max(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PooledTerm {
    pub term: String,
    pub estimate: f64,
    pub within: f64,  // mean per-imputation variance
    pub between: f64, // variance of the estimates across imputations
    pub total: f64,
    pub std_error: f64,
    pub hazard_ratio: f64,
    pub lower: f64,
    pub upper: f64,
    pub p_value: f64,
    pub riv: f64,    // relative increase in variance due to missingness
    pub lambda: f64, // share of total variance from missingness
    pub fmi: f64,    // fraction of missing information
    pub df_old: f64,
    pub df: f64, // barnard-rubin
}

#[derive(Debug, Clone, Serialize)]
pub struct PooledEstimate {
    pub m: usize,
    pub confidence_level: f64,
    pub terms: Vec<PooledTerm>,
    pub coefficients: Array1<f64>,
    pub within: Array2<f64>,
    pub between: Array2<f64>,
    pub total: Array2<f64>,
}

impl PooledEstimate {
    pub fn term(&self, name: &str) -> Option<&PooledTerm> {
        self.terms.iter().find(|t| t.term == name)
    }
}

/// Apply the pool policy to per-imputation outcomes, indexed by imputation.
pub fn collect_estimates(
    outcomes: Vec<Result<ImputationEstimate>>,
    policy: PoolPolicy,
) -> Result<Vec<ImputationEstimate>> {
    let mut kept = Vec::with_capacity(outcomes.len());
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match (outcome, policy) {
            (Ok(estimate), _) => kept.push(estimate),
            (Err(e), PoolPolicy::Abort) => return Err(wrap(index, e)),
            (Err(e), PoolPolicy::ExcludeFailed) => {
                warn!("excluding imputation {index} from pooling: {e}");
            }
        }
    }
    if kept.len() < 2 {
        return Err(SurvivalError::InsufficientImputations { m: kept.len() });
    }
    Ok(kept)
}

/// fits whose terms differ from the most common set count as failed imputations
pub fn align_terms<T>(outcomes: Vec<Result<T>>, terms_of: impl Fn(&T) -> Vec<String>) -> Vec<Result<T>> {
    let names: Vec<Option<Vec<String>>> = outcomes.iter().map(|o| o.as_ref().ok().map(&terms_of)).collect();

    let mut expected: Option<&Vec<String>> = None;
    let mut best = 0;
    for candidate in names.iter().flatten() {
        let count = names.iter().flatten().filter(|n| *n == candidate).count();
        if count > best {
            best = count;
            expected = Some(candidate);
        }
    }
    let Some(expected) = expected.cloned() else {
        return outcomes;
    };

    outcomes
        .into_iter()
        .zip(names)
        .enumerate()
        .map(|(index, (outcome, terms))| match terms {
            Some(terms) if terms != expected => Err(SurvivalError::imputation_failed(
                index,
                SurvivalError::invalid_dimensions(format!("terms {terms:?} differ from {expected:?}")),
            )),
            _ => outcome,
        })
        .collect()
}

fn wrap(index: usize, e: SurvivalError) -> SurvivalError {
    match e {
        SurvivalError::ImputationFailed { .. } => e,
        other => SurvivalError::imputation_failed(index, other),
    }
}

/// rubin's rules: T = W + (1 + 1/M) B, barnard-rubin df, normal-quantile intervals
pub fn pool(estimates: &[ImputationEstimate], confidence_level: f64) -> Result<PooledEstimate> {
    let m = estimates.len();
    if m < 2 {
        return Err(SurvivalError::InsufficientImputations { m });
    }
    let z = metrics::normal_quantile_for_level(confidence_level)?;

    let first = &estimates[0];
    let p = first.coefficients.len();
    for (index, estimate) in estimates.iter().enumerate() {
        if estimate.terms != first.terms
            || estimate.coefficients.len() != p
            || estimate.covariance.dim() != (p, p)
        {
            return Err(SurvivalError::invalid_dimensions(format!(
                "imputation {index} has terms {:?}, expected {:?}",
                estimate.terms, first.terms
            )));
        }
    }

    let mf = m as f64;
    let mut coefficients = Array1::<f64>::zeros(p);
    let mut within = Array2::<f64>::zeros((p, p));
    for estimate in estimates {
        coefficients += &estimate.coefficients;
        within += &estimate.covariance;
    }
    coefficients /= mf;
    within /= mf;

    let mut between = Array2::<f64>::zeros((p, p));
    for estimate in estimates {
        let d = &estimate.coefficients - &coefficients;
        for j in 0..p {
            for k in 0..p {
                between[[j, k]] += d[j] * d[k];
            }
        }
    }
    between /= mf - 1.0;

    let inflate = 1.0 + 1.0 / mf;
    let total = &within + &(&between * inflate);
    let df_complete = estimates.iter().map(|e| e.df_complete).fold(f64::INFINITY, f64::min);

    let terms = (0..p)
        .map(|j| {
            let estimate = coefficients[j];
            let (w, b, t) = (within[[j, j]], between[[j, j]], total[[j, j]]);
            let std_error = t.sqrt();
            let riv = inflate * b / w;
            let lambda = inflate * b / t;
            let df_old = if lambda > 0.0 { (mf - 1.0) / lambda.powi(2) } else { f64::INFINITY };
            let df_observed = if df_complete.is_finite() {
                (df_complete + 1.0) / (df_complete + 3.0) * df_complete * (1.0 - lambda)
            } else {
                f64::INFINITY
            };
            let df = match (df_old.is_finite(), df_observed.is_finite()) {
                (true, true) => df_old * df_observed / (df_old + df_observed),
                (true, false) => df_old,
                (false, _) => df_observed,
            };
            let fmi = (riv + 2.0 / (df + 3.0)) / (riv + 1.0);

            PooledTerm {
                term: first.terms[j].clone(),
                estimate,
                within: w,
                between: b,
                total: t,
                std_error,
                hazard_ratio: estimate.exp(),
                lower: (estimate - z * std_error).exp(),
                upper: (estimate + z * std_error).exp(),
                p_value: metrics::two_sided_p(estimate / std_error),
                riv,
                lambda,
                fmi,
                df_old,
                df,
            }
        })
        .collect();

    Ok(PooledEstimate { m, confidence_level, terms, coefficients, within, between, total })
}
