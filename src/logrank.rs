use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::{
    design::RANK_TOL,
    error::{Result, SurvivalError},
    linalg,
    metrics::{self, ChiSquareTest},
};

/// k-sample log-rank comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRankTest {
    pub groups: Vec<String>,
    pub n: Vec<usize>,
    pub observed: Vec<f64>,
    pub expected: Vec<f64>,
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

impl LogRankTest {
    pub fn as_chi_square(&self) -> ChiSquareTest {
        ChiSquareTest { statistic: self.statistic, df: self.df, p_value: self.p_value }
    }
}

/// Log-rank test across the groups coded in `groups` (indices into `labels`).
///
/// Labels with no subjects are dropped. The statistic is (O - E)' V^- (O - E)
/// with a generalised inverse of V, on df = rank(V). A group never at risk at a
/// death time has a zero row in V and does not add a degree of freedom.
pub fn log_rank(times: &[f64], events: &[bool], groups: &[usize], labels: &[String]) -> Result<LogRankTest> {
    let n = times.len();
    if events.len() != n || groups.len() != n {
        return Err(SurvivalError::invalid_dimensions(
            "times, events and groups must have same length",
        ));
    }
    if groups.iter().any(|&g| g >= labels.len()) {
        return Err(SurvivalError::invalid_dimensions("group code without a label"));
    }

    // compact to populated groups
    let mut sizes = vec![0usize; labels.len()];
    for &g in groups {
        sizes[g] += 1;
    }
    let populated: Vec<usize> = (0..labels.len()).filter(|&g| sizes[g] > 0).collect();
    let k = populated.len();
    if k < 2 {
        return Err(SurvivalError::invalid_parameter("log-rank groups", k));
    }
    let mut slot = vec![usize::MAX; labels.len()];
    for (s, &g) in populated.iter().enumerate() {
        slot[g] = s;
    }

    let mut at_risk: Vec<f64> = populated.iter().map(|&g| sizes[g] as f64).collect();
    let mut observed = Array1::<f64>::zeros(k);
    let mut expected = Array1::<f64>::zeros(k);
    let mut variance = Array2::<f64>::zeros((k, k));

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

    let mut start = 0;
    while start < n {
        let time = times[order[start]];
        let mut end = start;
        while end < n && times[order[end]] == time {
            end += 1;
        }

        let mut deaths = vec![0.0; k];
        for &i in &order[start..end] {
            if events[i] {
                deaths[slot[groups[i]]] += 1.0;
            }
        }
        let d: f64 = deaths.iter().sum();
        let total: f64 = at_risk.iter().sum();

        if d > 0.0 {
            for g in 0..k {
                observed[g] += deaths[g];
                expected[g] += d * at_risk[g] / total;
            }
            if total > 1.0 {
                let scale = d * (total - d) / (total - 1.0);
                for g in 0..k {
                    let pg = at_risk[g] / total;
                    for h in 0..k {
                        let ph = at_risk[h] / total;
                        let delta = if g == h { 1.0 } else { 0.0 };
                        variance[[g, h]] += scale * pg * (delta - ph);
                    }
                }
            }
        }

        for &i in &order[start..end] {
            at_risk[slot[groups[i]]] -= 1.0;
        }
        start = end;
    }

    let diff = &observed - &expected;
    let (values, vectors) = linalg::symmetric_eigen(variance.view())?;
    let largest = values.iter().copied().fold(0.0, f64::max);
    let mut statistic = 0.0;
    let mut df = 0;
    for (j, &lambda) in values.iter().enumerate() {
        if lambda > RANK_TOL * largest {
            let projection = vectors.column(j).dot(&diff);
            statistic += projection * projection / lambda;
            df += 1;
        }
    }
    if df == 0 {
        return Err(SurvivalError::numerical_error(
            "log-rank variance is zero: no death time with two groups at risk",
        ));
    }

    Ok(LogRankTest {
        groups: populated.iter().map(|&g| labels[g].clone()).collect(),
        n: populated.iter().map(|&g| sizes[g]).collect(),
        observed: observed.to_vec(),
        expected: expected.to_vec(),
        statistic,
        df,
        p_value: metrics::chi2_sf(statistic, df),
    })
}
