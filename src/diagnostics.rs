use std::collections::BTreeSet;

use log::warn;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    data::SurvivalData,
    design::Term,
    error::{Result, SurvivalError},
    kaplan_meier::{KaplanMeier, SurvivalCurve},
    metrics::ChiSquareTest,
    model::CoxFit,
    optimization,
};

/// Time scale the residual trend is tested against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeTransform {
    Identity,
    Log,
    Rank,
    /// 1 - S(t-) of the pooled Kaplan-Meier curve
    #[default]
    KaplanMeier,
}

/// (ln t, ln(-ln S)) points of one curve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloglogSeries {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// Steps with t > 0 and 0 < S < 1 on the complementary log-log scale.
pub fn cloglog(curve: &SurvivalCurve) -> CloglogSeries {
    let points = curve
        .steps
        .iter()
        .filter(|s| s.time > 0.0 && s.survival > 0.0 && s.survival < 1.0)
        .map(|s| (s.time.ln(), (-s.survival.ln()).ln()))
        .collect();
    CloglogSeries { label: curve.label.clone(), points }
}

pub fn cloglog_by_stratum(km: &KaplanMeier) -> Vec<CloglogSeries> {
    km.curves.iter().map(cloglog).collect()
}

/// Schoenfeld residuals, one row per event, ordered by stratum then time
#[derive(Debug, Clone, Serialize)]
pub struct SchoenfeldResiduals {
    pub times: Vec<f64>,
    pub strata: Vec<usize>,
    pub residuals: Array2<f64>, // n_events x p
    pub scaled: Array2<f64>,    // beta + n_events * V r
}

/// observed minus risk-set weighted mean per event (efron: averaged over sub-steps)
pub fn schoenfeld_residuals(data: &SurvivalData, fit: &CoxFit) -> Result<SchoenfeldResiduals> {
    let beta = fit.coefficients();
    let p = data.n_features();
    if beta.len() != p {
        return Err(SurvivalError::invalid_dimensions(format!(
            "fit has {} coefficients, data has {p} covariates",
            beta.len()
        )));
    }

    let x = data.centred_covariates();
    let (_, weights) = optimization::risk_weights(x.view(), beta);
    let ties = fit.ties();

    let mut times = Vec::new();
    let mut strata = Vec::new();
    let mut rows: Vec<Array1<f64>> = Vec::new();

    optimization::walk_event_groups(data, x.view(), &weights, |group| {
        let d = group.deaths.len();
        let mut expected = Array1::<f64>::zeros(p);
        for l in 0..d {
            let (_, mean, _) = group.moments(l, ties)?;
            expected += &mean;
        }
        expected /= d as f64;
        for &i in group.deaths {
            times.push(group.time);
            strata.push(group.stratum);
            rows.push(&x.row(i) - &expected);
        }
        Ok(())
    })?;

    let n_events = rows.len();
    let mut residuals = Array2::zeros((n_events, p));
    for (k, row) in rows.iter().enumerate() {
        residuals.row_mut(k).assign(row);
    }

    let v = fit.covariance();
    let mut scaled = residuals.dot(v) * n_events as f64;
    scaled += beta;

    Ok(SchoenfeldResiduals { times, strata, residuals, scaled })
}

/// trend test for one covariate
#[derive(Debug, Clone, Serialize)]
pub struct CovariateTest {
    pub term: Term,
    pub correlation: f64, // between g(t) and the scaled residual
    pub test: ChiSquareTest,
    pub violated: bool,
}

/// Grambsch-Therneau results for a fitted model
#[derive(Debug, Clone, Serialize)]
pub struct PhAssessment {
    pub transform: TimeTransform,
    pub significance_level: f64,
    pub covariates: Vec<CovariateTest>,
    pub global: ChiSquareTest,
    pub global_violated: bool,
}

impl PhAssessment {
    pub fn violated(&self) -> bool {
        self.global_violated || self.covariates.iter().any(|c| c.violated)
    }

    pub fn violating_terms(&self) -> Vec<&Term> {
        self.covariates.iter().filter(|c| c.violated).map(|c| &c.term).collect()
    }

    /// categorical columns to stratify on (violating continuous terms aren't listed)
    pub fn remediation(&self) -> Vec<String> {
        let columns: BTreeSet<&str> = self
            .violating_terms()
            .into_iter()
            .filter(|t| t.level.is_some())
            .map(|t| t.column.as_str())
            .collect();
        columns.into_iter().map(str::to_string).collect()
    }
}

/// transformed event times g(t_k), one per residual row
fn transform_times(data: &SurvivalData, event_times: &[f64], transform: TimeTransform) -> Result<Vec<f64>> {
    Ok(match transform {
        TimeTransform::Identity => event_times.to_vec(),
        TimeTransform::Log => {
            if event_times.iter().any(|&t| t <= 0.0) {
                return Err(SurvivalError::invalid_parameter(
                    "transform",
                    "log requires positive event times",
                ));
            }
            event_times.iter().map(|t| t.ln()).collect()
        }
        TimeTransform::Rank => {
            // average ranks among all event times
            let mut sorted = event_times.to_vec();
            sorted.sort_by(f64::total_cmp);
            event_times
                .iter()
                .map(|&t| {
                    let below = sorted.partition_point(|&s| s < t);
                    let through = sorted.partition_point(|&s| s <= t);
                    (below + through + 1) as f64 / 2.0
                })
                .collect()
        }
        TimeTransform::KaplanMeier => {
            let times = data.times().to_vec();
            let curve = SurvivalCurve::fit(&times, data.events(), "all", 0.95)?;
            event_times
                .iter()
                .map(|&t| {
                    let before = curve
                        .steps
                        .iter()
                        .take_while(|s| s.time < t)
                        .last()
                        .map_or(1.0, |s| s.survival);
                    1.0 - before
                })
                .collect()
        }
    })
}

fn correlation(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let ma = a.mean().unwrap_or(0.0);
    let mb = b.mean().unwrap_or(0.0);
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma).powi(2);
        sbb += (y - mb).powi(2);
    }
    if saa > 0.0 && sbb > 0.0 { sab / (saa * sbb).sqrt() } else { 0.0 }
}

/// Grambsch-Therneau test of every covariate and of the model as a whole.
pub fn proportional_hazards_test(
    data: &SurvivalData,
    fit: &CoxFit,
    transform: TimeTransform,
    significance_level: f64,
) -> Result<PhAssessment> {
    if !(significance_level > 0.0 && significance_level < 1.0) {
        return Err(SurvivalError::invalid_parameter("significance_level", significance_level));
    }

    let resid = schoenfeld_residuals(data, fit)?;
    let n_events = resid.times.len();
    let p = data.n_features();

    let g = Array1::from(transform_times(data, &resid.times, transform)?);
    let g = &g - g.mean().unwrap_or(0.0);
    let g_ss = g.dot(&g);
    if !(g_ss > 0.0) {
        return Err(SurvivalError::numerical_error(
            "transformed event times have no spread; need events at two or more times",
        ));
    }

    let v = fit.covariance();
    let u = resid.residuals.t().dot(&g); // sum_k g_k r_k
    let vu = v.dot(&u);
    let d = n_events as f64;

    let mut covariates = Vec::with_capacity(p);
    for (j, term) in data.terms().iter().enumerate() {
        let statistic = d * vu[j].powi(2) / (v[[j, j]] * g_ss);
        let test = ChiSquareTest::new(statistic, 1);
        let violated = test.p_value < significance_level;
        if violated {
            warn!(
                "proportional hazards rejected for '{}' (chi2 {:.3}, p {:.4})",
                term.name, test.statistic, test.p_value
            );
        }
        covariates.push(CovariateTest {
            term: term.clone(),
            correlation: correlation(&g, &resid.scaled.index_axis(Axis(1), j).to_owned()),
            test,
            violated,
        });
    }

    let global = ChiSquareTest::new(d * u.dot(&vu) / g_ss, p);
    let global_violated = global.p_value < significance_level;
    if global_violated {
        warn!("global proportional hazards test rejected (chi2 {:.3}, p {:.4})", global.statistic, global.p_value);
    }

    Ok(PhAssessment { transform, significance_level, covariates, global, global_violated })
}
