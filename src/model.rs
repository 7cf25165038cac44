use std::fmt;

use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView2};
use serde::Serialize;

use crate::{
    config::CoxConfig,
    data::SurvivalData,
    design::{self, Term},
    error::{Result, SurvivalError},
    linalg,
    metrics::{self, ChiSquareTest},
    optimization::{CoxOptimizer, OptimizationConfig, TieMethod},
};

/// cox proportional hazards model - holds settings, `fit` produces an immutable `CoxFit`
#[derive(Debug, Clone)]
pub struct CoxModel {
    ties: TieMethod,
    max_iterations: usize,     // newton-raphson cap
    tolerance: f64,            // convergence threshold on max |step|
    max_step_halvings: usize,
    confidence_level: f64,     // for hazard ratio intervals
    condition_warning: f64,
}

impl Default for CoxModel {
    fn default() -> Self {
        Self::from_config(&CoxConfig::default())
    }
}

impl CoxModel {
    /// new cox model w/ defaults (efron ties, 95% intervals)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CoxConfig) -> Self {
        Self {
            ties: config.ties,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            max_step_halvings: config.max_step_halvings,
            confidence_level: config.confidence_level,
            condition_warning: config.condition_warning,
        }
    }

    pub fn with_ties(mut self, ties: TieMethod) -> Self {
        self.ties = ties;
        self
    }

    /// max iterations before giving up
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// how close is close enough for convergence
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = level;
        self
    }

    /// fit the model to data - validates the design, then runs newton-raphson
    pub fn fit(&self, data: &SurvivalData) -> Result<CoxFit> {
        let z_crit = metrics::normal_quantile_for_level(self.confidence_level)?;
        let n_events = data.n_events();
        if n_events == 0 {
            return Err(SurvivalError::invalid_survival_data("no events - nothing to fit"));
        }
        if data.n_features() == 0 {
            return Err(SurvivalError::invalid_dimensions("no covariates to fit"));
        }

        check_constant_covariates(data)?;
        let collinearity = design::collinearity(data.covariates())?;
        if collinearity.rank < data.n_features() {
            return Err(SurvivalError::RankDeficient {
                rank: collinearity.rank,
                columns: data.n_features(),
            });
        }
        if collinearity.condition_number > self.condition_warning {
            warn!(
                "design condition number {:.1} exceeds {:.1}, estimates may be unstable",
                collinearity.condition_number, self.condition_warning
            );
        }

        let config = OptimizationConfig {
            ties: self.ties,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            max_step_halvings: self.max_step_halvings,
        };
        let outcome = CoxOptimizer::new(config).optimize(data)?;
        let covariance = linalg::inverse_spd(outcome.at_beta.information.view())?;

        let risk_scores = data.covariates().dot(&outcome.beta);
        let concordance =
            metrics::concordance_index(risk_scores.view(), data.times(), data.events(), data.strata()).ok();
        let p = data.n_features();

        let fit = CoxFit {
            terms: data.terms().to_vec(),
            lr_test: metrics::likelihood_ratio_test(outcome.at_zero.loglik, outcome.at_beta.loglik, p),
            wald_test: metrics::wald_test(&outcome.beta, &outcome.at_beta.information),
            score_test: metrics::score_test(&outcome.at_zero)?,
            coefficients: outcome.beta,
            covariance,
            loglik: outcome.at_beta.loglik,
            null_loglik: outcome.at_zero.loglik,
            iterations: outcome.iterations,
            ties: self.ties,
            n_samples: data.n_samples(),
            n_events,
            stratum_labels: if data.n_strata() > 1 { data.stratum_labels().to_vec() } else { Vec::new() },
            confidence_level: self.confidence_level,
            z_crit,
            concordance,
            condition_number: collinearity.condition_number,
        };

        info!(
            "cox fit: {} terms, {} subjects, {} events, loglik {:.4} after {} iterations",
            p, fit.n_samples, fit.n_events, fit.loglik, fit.iterations
        );
        Ok(fit)
    }
}

/// a covariate constant inside every stratum carries no information
fn check_constant_covariates(data: &SurvivalData) -> Result<()> {
    let x = data.covariates();
    for (j, term) in data.terms().iter().enumerate() {
        let mut varying = 0;
        let mut populated = 0;
        for stratum in 0..data.n_strata() {
            let rows = data.stratum_order(stratum);
            let Some(&first) = rows.first() else { continue };
            populated += 1;
            if rows.iter().any(|&i| x[[i, j]] != x[[first, j]]) {
                varying += 1;
            }
        }
        if varying == 0 {
            return Err(SurvivalError::ConstantCovariate { term: term.name.clone() });
        }
        if varying < populated {
            warn!(
                "'{}' is constant in {} of {} strata",
                term.name,
                populated - varying,
                populated
            );
        }
    }
    Ok(())
}

/// one row of the coefficient table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermEstimate {
    pub term: String,
    pub coefficient: f64,
    pub std_error: f64,
    pub hazard_ratio: f64,
    pub lower: f64,
    pub upper: f64,
    pub z: f64,
    pub p_value: f64,
}

/// fitted cox model - immutable once produced
#[derive(Debug, Clone, Serialize)]
pub struct CoxFit {
    terms: Vec<Term>,
    coefficients: Array1<f64>,
    covariance: Array2<f64>,     // inverse observed information
    loglik: f64,
    null_loglik: f64,
    iterations: usize,
    ties: TieMethod,
    n_samples: usize,
    n_events: usize,
    stratum_labels: Vec<String>, // empty when unstratified
    confidence_level: f64,
    z_crit: f64,
    concordance: Option<f64>,
    condition_number: f64,
    lr_test: ChiSquareTest,
    wald_test: ChiSquareTest,
    score_test: ChiSquareTest,
}

impl CoxFit {
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn term_names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.clone()).collect()
    }

    /// the betas
    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn std_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }

    /// exp(beta)
    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.coefficients.mapv(f64::exp)
    }

    /// exp(beta -/+ z * se)
    pub fn confidence_intervals(&self) -> Vec<(f64, f64)> {
        self.coefficients
            .iter()
            .zip(self.std_errors().iter())
            .map(|(b, se)| ((b - self.z_crit * se).exp(), (b + self.z_crit * se).exp()))
            .collect()
    }

    pub fn estimates(&self) -> Vec<TermEstimate> {
        let se = self.std_errors();
        let ci = self.confidence_intervals();
        self.terms
            .iter()
            .enumerate()
            .map(|(j, term)| {
                let z = self.coefficients[j] / se[j];
                TermEstimate {
                    term: term.name.clone(),
                    coefficient: self.coefficients[j],
                    std_error: se[j],
                    hazard_ratio: self.coefficients[j].exp(),
                    lower: ci[j].0,
                    upper: ci[j].1,
                    z,
                    p_value: metrics::two_sided_p(z),
                }
            })
            .collect()
    }

    pub fn loglik(&self) -> f64 {
        self.loglik
    }

    pub fn null_loglik(&self) -> f64 {
        self.null_loglik
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn ties(&self) -> TieMethod {
        self.ties
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn stratum_labels(&self) -> &[String] {
        &self.stratum_labels
    }

    pub fn is_stratified(&self) -> bool {
        !self.stratum_labels.is_empty()
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    pub fn concordance(&self) -> Option<f64> {
        self.concordance
    }

    pub fn condition_number(&self) -> f64 {
        self.condition_number
    }

    pub fn likelihood_ratio_test(&self) -> ChiSquareTest {
        self.lr_test
    }

    pub fn wald_test(&self) -> ChiSquareTest {
        self.wald_test
    }

    pub fn score_test(&self) -> ChiSquareTest {
        self.score_test
    }

    pub fn aic(&self) -> f64 {
        metrics::aic(self.loglik, self.coefficients.len())
    }

    /// linear predictors x'beta for new rows
    pub fn predict(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        if covariates.ncols() != self.coefficients.len() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "feature count mismatch: expected {}, got {}",
                self.coefficients.len(),
                covariates.ncols()
            )));
        }
        Ok(covariates.dot(&self.coefficients))
    }

    /// relative hazards exp(x'beta)
    pub fn predict_hazard_ratios(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        Ok(self.predict(covariates)?.mapv(f64::exp))
    }

    /// display form of the fit
    pub fn table(&self) -> CoxTable {
        CoxTable {
            estimates: self.estimates(),
            n_samples: self.n_samples,
            n_events: self.n_events,
            strata: self.stratum_labels.clone(),
            confidence_level: self.confidence_level,
            concordance: self.concordance,
            lr_test: self.lr_test,
        }
    }
}

/// printable summary of a fit
#[derive(Debug, Clone, Serialize)]
pub struct CoxTable {
    pub estimates: Vec<TermEstimate>,
    pub n_samples: usize,
    pub n_events: usize,
    pub strata: Vec<String>,
    pub confidence_level: f64,
    pub concordance: Option<f64>,
    pub lr_test: ChiSquareTest,
}

impl fmt::Display for CoxTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "n = {}, events = {}", self.n_samples, self.n_events)?;
        if !self.strata.is_empty() {
            writeln!(f, "stratified by: {}", self.strata.join(", "))?;
        }
        let pct = self.confidence_level * 100.0;
        writeln!(
            f,
            "{:<28} {:>9} {:>9} {:>8} {:>9} {:>9} {:>9}",
            "term", "coef", "HR", "se", format!("lo {pct:.0}%"), format!("hi {pct:.0}%"), "p"
        )?;
        writeln!(f, "{:-<86}", "")?;
        for e in &self.estimates {
            writeln!(
                f,
                "{:<28} {:>9.4} {:>9.4} {:>8.4} {:>9.4} {:>9.4} {:>9.4}",
                e.term, e.coefficient, e.hazard_ratio, e.std_error, e.lower, e.upper, e.p_value
            )?;
        }
        if let Some(c) = self.concordance {
            writeln!(f, "concordance = {c:.3}")?;
        }
        write!(
            f,
            "likelihood ratio test = {:.2} on {} df, p = {:.4}",
            self.lr_test.statistic, self.lr_test.df, self.lr_test.p_value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_data() -> SurvivalData {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let events = vec![true, false, true, true, false, true, true, false];
        let covariates = Array2::from_shape_vec(
            (8, 2),
            vec![1.0, 0.5, 0.0, -0.5, 1.0, 0.0, 0.0, 1.0, 0.0, -1.0, 1.0, 0.5, 0.0, -0.5, 1.0, 0.0],
        )
        .unwrap();

        SurvivalData::new(times, events, covariates).unwrap()
    }

    #[test]
    fn test_model_builder() {
        let model = CoxModel::new()
            .with_ties(TieMethod::Breslow)
            .with_max_iterations(10)
            .with_tolerance(1e-6);

        assert_eq!(model.ties, TieMethod::Breslow);
        assert_eq!(model.max_iterations, 10);
        assert_eq!(model.tolerance, 1e-6);
    }

    #[test]
    fn test_fit_outputs_consistent() {
        let fit = CoxModel::new().fit(&create_test_data()).unwrap();

        assert_eq!(fit.coefficients().len(), 2);
        let hr = fit.hazard_ratios();
        let se = fit.std_errors();
        for (j, (lo, hi)) in fit.confidence_intervals().into_iter().enumerate() {
            assert_relative_eq!(hr[j], fit.coefficients()[j].exp(), epsilon = 1e-12);
            assert!(lo < hr[j] && hr[j] < hi);
            assert_relative_eq!((hi / lo).ln(), 2.0 * 1.959963984540054 * se[j], epsilon = 1e-8);
        }
        assert!(fit.loglik() >= fit.null_loglik());
    }

    #[test]
    fn test_constant_covariate_rejected() {
        let covariates = Array2::from_shape_vec((4, 2), vec![1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0]).unwrap();
        let data = SurvivalData::new(vec![1.0, 2.0, 3.0, 4.0], vec![true; 4], covariates).unwrap();

        let err = CoxModel::new().fit(&data).unwrap_err();
        assert!(matches!(err, SurvivalError::ConstantCovariate { ref term } if term == "x0"));
    }

    #[test]
    fn test_collinear_design_rejected() {
        let covariates = Array2::from_shape_vec(
            (5, 2),
            vec![1.0, 2.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 1.0, 2.0],
        )
        .unwrap();
        let data = SurvivalData::new(vec![1.0, 2.0, 3.0, 4.0, 5.0], vec![true; 5], covariates).unwrap();

        let err = CoxModel::new().fit(&data).unwrap_err();
        assert!(matches!(err, SurvivalError::RankDeficient { rank: 1, columns: 2 }));
    }

    #[test]
    fn test_no_events_rejected() {
        let covariates = Array2::from_shape_vec((3, 1), vec![0.0, 1.0, 0.0]).unwrap();
        let data = SurvivalData::new(vec![1.0, 2.0, 3.0], vec![false; 3], covariates).unwrap();
        assert!(CoxModel::new().fit(&data).is_err());
    }

    #[test]
    fn test_prediction_dimension_mismatch() {
        let fit = CoxModel::new().fit(&create_test_data()).unwrap();
        let wrong = Array2::zeros((5, 3));
        assert!(fit.predict(wrong.view()).is_err());
    }

    #[test]
    fn test_table_display() {
        let fit = CoxModel::new().fit(&create_test_data()).unwrap();
        let text = fit.table().to_string();
        assert!(text.contains("x0"));
        assert!(text.contains("likelihood ratio test"));
    }
}
