use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::{AnalysisConfig, CoxConfig},
    data::SurvivalData,
    design,
    diagnostics::{self, CloglogSeries, PhAssessment},
    error::{Result, SurvivalError},
    imputation,
    kaplan_meier::{self, KaplanMeier},
    metrics::ChiSquareTest,
    model::{CoxFit, CoxModel, TermEstimate},
    pooling::{self, ImputationEstimate, PoolPolicy, PooledEstimate},
    table::Table,
};

/// covariates entering the linear predictor plus columns to stratify on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoxSpec {
    pub covariates: Vec<String>,
    #[serde(default)]
    pub strata: Vec<String>,
}

impl CoxSpec {
    pub fn new<S: AsRef<str>>(covariates: &[S]) -> Self {
        Self {
            covariates: covariates.iter().map(|c| c.as_ref().to_string()).collect(),
            strata: Vec::new(),
        }
    }

    pub fn stratified_by<S: AsRef<str>>(mut self, strata: &[S]) -> Self {
        self.strata = strata.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// every column the model reads
    pub fn columns(&self) -> Vec<String> {
        self.covariates.iter().chain(&self.strata).cloned().collect()
    }

    /// Move `columns` from the linear predictor into the strata.
    pub fn restratify(&self, columns: &[String]) -> Self {
        let mut strata = self.strata.clone();
        for column in columns {
            if !strata.contains(column) {
                strata.push(column.clone());
            }
        }
        Self {
            covariates: self.covariates.iter().filter(|c| !columns.contains(*c)).cloned().collect(),
            strata,
        }
    }

    pub fn data(&self, table: &Table) -> Result<SurvivalData> {
        let data = SurvivalData::from_table(table, &self.covariates, None)?;
        if self.strata.is_empty() {
            return Ok(data);
        }
        let (codes, labels) = design::combined_strata(table, &self.strata)?;
        data.with_strata(codes, labels)
    }
}

/// Build the model data from a complete table and fit it.
pub fn fit_cox(table: &Table, spec: &CoxSpec, config: &CoxConfig) -> Result<(SurvivalData, CoxFit)> {
    let data = spec.data(table)?;
    let fit = CoxModel::from_config(config).fit(&data)?;
    Ok((data, fit))
}

/// refit after moving PH-violating factors into the strata
#[derive(Debug, Clone, Serialize)]
pub struct StratifiedRefit {
    pub spec: CoxSpec,
    pub fit: CoxFit,
    pub ph: PhAssessment,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteCaseReport {
    pub spec: CoxSpec,
    pub n_total: usize,
    pub n_used: usize,
    pub fit: CoxFit,
    pub ph: PhAssessment,
    pub stratified: Option<StratifiedRefit>,
}

/// complete cases only; refits stratified when a categorical covariate breaks PH
#[derive(Debug, Clone, Default)]
pub struct CompleteCaseAnalysis {
    config: AnalysisConfig,
}

impl CompleteCaseAnalysis {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, table: &Table, spec: &CoxSpec) -> Result<CompleteCaseReport> {
        let rows = table.complete_rows(&spec.columns())?;
        let complete = table.subset(&rows)?;
        info!(
            "complete-case analysis: {} of {} subjects have every model column",
            rows.len(),
            table.n_rows()
        );

        let (data, fit) = fit_cox(&complete, spec, &self.config.cox)?;
        let ph = self.assess(&data, &fit)?;

        let remedy = ph.remediation();
        let stratified = if remedy.is_empty() {
            None
        } else {
            let refit_spec = spec.restratify(&remedy);
            if refit_spec.covariates.is_empty() {
                warn!("stratifying on {} leaves no covariates, skipping refit", remedy.join(", "));
                None
            } else {
                info!("refitting stratified on {}", remedy.join(", "));
                let (data, fit) = fit_cox(&complete, &refit_spec, &self.config.cox)?;
                let ph = self.assess(&data, &fit)?;
                Some(StratifiedRefit { spec: refit_spec, fit, ph })
            }
        };

        Ok(CompleteCaseReport {
            spec: spec.clone(),
            n_total: table.n_rows(),
            n_used: rows.len(),
            fit,
            ph,
            stratified,
        })
    }

    fn assess(&self, data: &SurvivalData, fit: &CoxFit) -> Result<PhAssessment> {
        let settings = &self.config.diagnostics;
        diagnostics::proportional_hazards_test(data, fit, settings.transform, settings.significance_level)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MultipleImputationReport {
    pub spec: CoxSpec,
    pub imputed_columns: Vec<String>,
    pub fits: Vec<CoxFit>, // successful per-imputation fits
    pub excluded: Vec<usize>,
    pub pooled: PooledEstimate,
}

/// Impute the model columns M times, fit each completed table, pool by Rubin's rules.
#[derive(Debug, Clone, Default)]
pub struct MultipleImputationAnalysis {
    config: AnalysisConfig,
}

impl MultipleImputationAnalysis {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, table: &Table, spec: &CoxSpec) -> Result<MultipleImputationReport> {
        let settings = &self.config.imputation;
        if settings.imputations < 2 {
            return Err(SurvivalError::InsufficientImputations { m: settings.imputations });
        }

        let analysis_table = table.select(&spec.columns())?;
        let ensemble = imputation::impute(&analysis_table, settings)?;

        let fitted: Vec<Result<CoxFit>> = ensemble
            .datasets()
            .par_iter()
            .enumerate()
            .map(|(index, completed)| {
                fit_cox(completed, spec, &self.config.cox)
                    .map(|(_, fit)| fit)
                    .map_err(|e| SurvivalError::imputation_failed(index, e))
            })
            .collect();
        // a level absent from one completed table drops a term from that fit
        let outcomes = pooling::align_terms(fitted, CoxFit::term_names);

        let excluded: Vec<usize> = match settings.pool_policy {
            PoolPolicy::Abort => Vec::new(),
            PoolPolicy::ExcludeFailed => {
                outcomes.iter().enumerate().filter(|(_, o)| o.is_err()).map(|(i, _)| i).collect()
            }
        };

        let mut fits = Vec::new();
        let mut per_imputation = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(fit) => {
                    per_imputation.push(Ok(ImputationEstimate::from(&fit)));
                    fits.push(fit);
                }
                Err(e) => per_imputation.push(Err(e)),
            }
        }

        let estimates = pooling::collect_estimates(per_imputation, settings.pool_policy)?;
        let pooled = pooling::pool(&estimates, self.config.cox.confidence_level)?;

        info!(
            "pooled {} of {} imputed fits over {} terms",
            pooled.m,
            ensemble.len(),
            pooled.terms.len()
        );

        Ok(MultipleImputationReport {
            spec: spec.clone(),
            imputed_columns: ensemble.imputed_columns().to_vec(),
            fits,
            excluded,
            pooled,
        })
    }
}

/// one covariate on its own, complete cases for that covariate only
#[derive(Debug, Clone, Serialize)]
pub struct UnivariateFit {
    pub covariate: String,
    pub n_used: usize,
    pub estimates: Vec<TermEstimate>,
    pub likelihood_ratio: ChiSquareTest,
}

pub fn univariate_screen<S: AsRef<str>>(
    table: &Table,
    covariates: &[S],
    config: &CoxConfig,
) -> Result<Vec<UnivariateFit>> {
    covariates
        .iter()
        .map(|covariate| {
            let covariate = covariate.as_ref();
            let rows = table.complete_rows(&[covariate])?;
            let complete = table.subset(&rows)?;
            let (_, fit) = fit_cox(&complete, &CoxSpec::new(&[covariate]), config)?;
            Ok(UnivariateFit {
                covariate: covariate.to_string(),
                n_used: rows.len(),
                estimates: fit.estimates(),
                likelihood_ratio: fit.likelihood_ratio_test(),
            })
        })
        .collect()
}

/// Kaplan-Meier curves by one factor with the log-rank test and cloglog series
#[derive(Debug, Clone, Serialize)]
pub struct SurvivalComparison {
    pub km: KaplanMeier,
    pub cloglog: Vec<CloglogSeries>,
}

pub fn survival_by_factor(table: &Table, factor: &str, config: &AnalysisConfig) -> Result<SurvivalComparison> {
    let km = kaplan_meier::kaplan_meier(table, Some(factor), config.survival.confidence_level)?;
    let cloglog = diagnostics::cloglog_by_stratum(&km);
    if let Some(test) = &km.log_rank {
        info!(
            "log-rank by '{factor}': chi2 {:.3} on {} df, p {:.4}",
            test.statistic, test.df, test.p_value
        );
    }
    Ok(SurvivalComparison { km, cloglog })
}
