use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::{
    error::{Result, SurvivalError},
    linalg,
    optimization::Derivatives,
};

/// upper tail of the chi-square distribution, P(X > x)
pub fn chi2_sf(x: f64, df: usize) -> f64 {
    if !(x > 0.0) || df == 0 {
        return 1.0;
    }
    if !x.is_finite() {
        return 0.0;
    }
    statrs::function::gamma::gamma_ur(df as f64 / 2.0, x / 2.0)
}

/// standard normal survival function P(Z > z)
pub fn normal_sf(z: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(z / std::f64::consts::SQRT_2)
}

/// two-sided p-value of a z statistic
pub fn two_sided_p(z: f64) -> f64 {
    (2.0 * normal_sf(z.abs())).min(1.0)
}

/// z such that a symmetric interval covers `level` (0.95 -> 1.96)
pub fn normal_quantile_for_level(level: f64) -> Result<f64> {
    if !(level > 0.0 && level < 1.0) {
        return Err(SurvivalError::invalid_parameter("confidence_level", level));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| SurvivalError::numerical_error(e.to_string()))?;
    Ok(normal.inverse_cdf(1.0 - (1.0 - level) / 2.0))
}

/// chi-square test result
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

impl ChiSquareTest {
    pub fn new(statistic: f64, df: usize) -> Self {
        Self { statistic, df, p_value: chi2_sf(statistic, df) }
    }
}

/// 2 (ll - ll0) on p df
pub fn likelihood_ratio_test(null_loglik: f64, loglik: f64, df: usize) -> ChiSquareTest {
    ChiSquareTest::new((2.0 * (loglik - null_loglik)).max(0.0), df)
}

/// beta' V^-1 beta on p df
pub fn wald_test(beta: &Array1<f64>, information: &Array2<f64>) -> ChiSquareTest {
    ChiSquareTest::new(beta.dot(&information.dot(beta)), beta.len())
}

/// U(0)' I(0)^-1 U(0) - with a single factor this is the log-rank test
pub fn score_test(at_zero: &Derivatives) -> Result<ChiSquareTest> {
    let u = &at_zero.gradient;
    let solved = linalg::solve(at_zero.information.view(), u.view())?;
    Ok(ChiSquareTest::new(u.dot(&solved), u.len()))
}

/// Harrell's concordance; pairs are only compared inside a stratum
pub fn concordance_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
    strata: &[usize],
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() || n != strata.len() {
        return Err(SurvivalError::invalid_dimensions(
            "risk scores, times, events and strata must have same length",
        ));
    }

    let mut concordant = 0.0;
    let mut comparable = 0.0;

    for i in 0..n {
        if !events[i] {
            continue; // censored subjects can't anchor a pair
        }
        for j in 0..n {
            if i == j || strata[i] != strata[j] {
                continue;
            }
            // j outlived i (or was censored no earlier than i's death)
            if times[j] > times[i] || (!events[j] && times[j] == times[i]) {
                comparable += 1.0;
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] == risk_scores[j] {
                    concordant += 0.5;
                }
            }
        }
    }

    if comparable == 0.0 {
        return Err(SurvivalError::numerical_error("no comparable pairs for concordance"));
    }

    Ok(concordant / comparable)
}

/// Akaike information criterion for a partial likelihood with p terms
pub fn aic(log_likelihood: f64, n_parameters: usize) -> f64 {
    2.0 * n_parameters as f64 - 2.0 * log_likelihood
}
