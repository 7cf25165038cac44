use log::{info, warn};
use serde::Serialize;

use crate::{
    error::{Result, SurvivalError},
    logrank::{self, LogRankTest},
    metrics,
    table::Table,
};

/// one distinct observed time on a curve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurvivalStep {
    pub time: f64,
    pub n_risk: usize,
    pub n_event: usize,
    pub n_censor: usize,
    pub survival: f64,
    pub std_error: f64, // greenwood
    pub lower: f64,     // log-scale pointwise interval, NaN once survival hits 0
    pub upper: f64,
}

/// right-continuous step function, 1.0 before the first event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurvivalCurve {
    pub label: String,
    pub n: usize,
    pub n_events: usize,
    pub confidence_level: f64,
    pub steps: Vec<SurvivalStep>,
}

impl SurvivalCurve {
    /// product-limit estimate over the given subjects
    pub fn fit(times: &[f64], events: &[bool], label: impl Into<String>, confidence_level: f64) -> Result<Self> {
        if times.len() != events.len() {
            return Err(SurvivalError::invalid_dimensions("times and events must have same length"));
        }
        if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(SurvivalError::invalid_survival_data("times must be finite and >= 0"));
        }
        let z = metrics::normal_quantile_for_level(confidence_level)?;

        let mut order: Vec<usize> = (0..times.len()).collect();
        order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

        let mut steps = Vec::new();
        let mut at_risk = times.len();
        let mut survival = 1.0;
        let mut greenwood = 0.0; // sum d / (n (n - d))

        let mut start = 0;
        while start < order.len() {
            let time = times[order[start]];
            let mut end = start;
            while end < order.len() && times[order[end]] == time {
                end += 1;
            }
            let n_event = order[start..end].iter().filter(|&&i| events[i]).count();
            let n_censor = end - start - n_event;

            if n_event > 0 {
                survival *= 1.0 - n_event as f64 / at_risk as f64;
                greenwood += if at_risk > n_event {
                    n_event as f64 / (at_risk as f64 * (at_risk - n_event) as f64)
                } else {
                    f64::INFINITY
                };
            }

            let (lower, upper) = if survival > 0.0 && greenwood.is_finite() {
                let half = z * greenwood.sqrt();
                ((survival.ln() - half).exp(), (survival.ln() + half).exp().min(1.0))
            } else {
                (f64::NAN, f64::NAN)
            };

            steps.push(SurvivalStep {
                time,
                n_risk: at_risk,
                n_event,
                n_censor,
                survival,
                std_error: if greenwood.is_finite() { survival * greenwood.sqrt() } else { f64::NAN },
                lower,
                upper,
            });

            at_risk -= end - start;
            start = end;
        }

        Ok(Self {
            label: label.into(),
            n: times.len(),
            n_events: events.iter().filter(|&&e| e).count(),
            confidence_level,
            steps,
        })
    }

    /// S(t); 1.0 before the first step
    pub fn survival_at(&self, t: f64) -> f64 {
        self.steps
            .iter()
            .take_while(|s| s.time <= t)
            .last()
            .map_or(1.0, |s| s.survival)
    }

    /// first time the curve reaches 0.5 or below
    pub fn median(&self) -> Option<f64> {
        self.steps.iter().find(|s| s.survival <= 0.5).map(|s| s.time)
    }

    /// median or `UndefinedMedian` when follow-up never reaches half survival
    pub fn require_median(&self) -> Result<f64> {
        self.median()
            .ok_or_else(|| SurvivalError::UndefinedMedian { stratum: self.label.clone() })
    }

    /// (lower, upper) limits for the median from where the bands cross 0.5
    pub fn median_interval(&self) -> (Option<f64>, Option<f64>) {
        let crossing = |band: fn(&SurvivalStep) -> f64| {
            self.steps
                .iter()
                .find(|s| s.survival == 0.0 || band(s) <= 0.5)
                .map(|s| s.time)
        };
        (crossing(|s| s.upper), crossing(|s| s.lower))
    }

    /// steps where at least one death happened
    pub fn event_steps(&self) -> impl Iterator<Item = &SurvivalStep> {
        self.steps.iter().filter(|s| s.n_event > 0)
    }
}

/// curves for each level of a factor, with the log-rank comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KaplanMeier {
    pub variable: Option<String>,
    pub curves: Vec<SurvivalCurve>,
    pub excluded: usize, // subjects with the stratifying value missing
    pub log_rank: Option<LogRankTest>,
}

impl KaplanMeier {
    pub fn curve(&self, label: &str) -> Option<&SurvivalCurve> {
        self.curves.iter().find(|c| c.label == label)
    }
}

/// curves per level of `strata` (whole cohort when None) plus the log-rank test.
/// missing strata values are left out and counted; curves survive a failed test
pub fn kaplan_meier(table: &Table, strata: Option<&str>, confidence_level: f64) -> Result<KaplanMeier> {
    let Some(name) = strata else {
        let curve = SurvivalCurve::fit(table.times(), table.events(), "all", confidence_level)?;
        return Ok(KaplanMeier { variable: None, curves: vec![curve], excluded: 0, log_rank: None });
    };

    let factor = table.factor(name)?;
    let rows: Vec<usize> = (0..table.n_rows()).filter(|&r| factor.codes()[r].is_some()).collect();
    let excluded = table.n_rows() - rows.len();
    if excluded > 0 {
        info!("kaplan-meier by '{name}': {excluded} subjects with missing value left out");
    }

    let mut curves = Vec::new();
    for (level, label) in factor.levels().iter().enumerate() {
        let members: Vec<usize> = rows.iter().copied().filter(|&r| factor.codes()[r] == Some(level)).collect();
        if members.is_empty() {
            continue;
        }
        let times: Vec<f64> = members.iter().map(|&r| table.times()[r]).collect();
        let events: Vec<bool> = members.iter().map(|&r| table.events()[r]).collect();
        curves.push(SurvivalCurve::fit(&times, &events, label.clone(), confidence_level)?);
    }

    let log_rank = if curves.len() >= 2 {
        let times: Vec<f64> = rows.iter().map(|&r| table.times()[r]).collect();
        let events: Vec<bool> = rows.iter().map(|&r| table.events()[r]).collect();
        let groups: Vec<usize> = rows.iter().filter_map(|&r| factor.codes()[r]).collect();
        match logrank::log_rank(&times, &events, &groups, factor.levels()) {
            Ok(test) => Some(test),
            Err(e) => {
                warn!("log-rank by '{name}' not computed: {e}");
                None
            }
        }
    } else {
        None
    };

    Ok(KaplanMeier { variable: Some(name.to_string()), curves, excluded, log_rank })
}
