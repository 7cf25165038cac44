use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{ChiSquared, Distribution, StandardNormal};
use rayon::prelude::*;

use crate::{
    config::ImputationConfig,
    error::{Result, SurvivalError},
    linalg,
    table::{Column, Table},
};

/// normal prior precision on logistic coefficients, keeps separated fits finite
const LOGIT_PRIOR_PRECISION: f64 = 0.1;
const LOGIT_MAX_ITERATIONS: usize = 50;
const LOGIT_TOLERANCE: f64 = 1e-8;

/// M completed copies of the input table
#[derive(Debug, Clone)]
pub struct ImputedEnsemble {
    datasets: Vec<Table>,
    imputed_columns: Vec<String>,
    seed: u64,
}

impl ImputedEnsemble {
    pub fn datasets(&self) -> &[Table] {
        &self.datasets
    }

    pub fn into_datasets(self) -> Vec<Table> {
        self.datasets
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// columns that had missing entries before imputation
    pub fn imputed_columns(&self) -> &[String] {
        &self.imputed_columns
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// M independent chains, chain m seeded `seed + m`
pub fn impute(table: &Table, config: &ImputationConfig) -> Result<ImputedEnsemble> {
    let m = config.imputations;
    if m < 2 {
        return Err(SurvivalError::InsufficientImputations { m });
    }

    let imputed_columns: Vec<String> = table.incomplete_columns().into_iter().map(str::to_string).collect();
    info!(
        "imputing {} incomplete columns ({}) into {m} datasets, {} cycles, seed {}",
        imputed_columns.len(),
        imputed_columns.join(", "),
        config.cycles,
        config.seed
    );

    let chains: Vec<Result<Table>> = (0..m)
        .into_par_iter()
        .map(|index| {
            impute_chain(table, config, config.seed.wrapping_add(index as u64))
                .map_err(|e| SurvivalError::imputation_failed(index, e))
        })
        .collect();

    let datasets = chains.into_iter().collect::<Result<Vec<_>>>()?;
    Ok(ImputedEnsemble { datasets, imputed_columns, seed: config.seed })
}

/// One chained-equation run, returning a completed table.
pub fn impute_chain(table: &Table, config: &ImputationConfig, seed: u64) -> Result<Table> {
    if config.cycles == 0 {
        return Err(SurvivalError::invalid_parameter("cycles", config.cycles));
    }
    if config.donors == 0 {
        return Err(SurvivalError::invalid_parameter("donors", config.donors));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut work = table.clone();

    // (column, rows originally missing)
    let targets: Vec<(String, Vec<usize>)> = table
        .columns()
        .iter()
        .filter_map(|(name, column)| {
            let missing: Vec<usize> = (0..column.len()).filter(|&r| column.is_missing(r)).collect();
            (!missing.is_empty()).then(|| (name.clone(), missing))
        })
        .collect();
    if targets.is_empty() {
        return Ok(work);
    }

    let outcome = if config.include_outcome {
        let events: Vec<f64> = table.events().iter().map(|&e| if e { 1.0 } else { 0.0 }).collect();
        vec![events, nelson_aalen(table.times(), table.events())]
    } else {
        Vec::new()
    };

    for (name, missing) in &targets {
        initialise(&mut work, name, missing, &mut rng)?;
    }

    for cycle in 0..config.cycles {
        for (name, missing) in &targets {
            let x = predictor_matrix(&work, name, &outcome);
            match work.column_mut(name)? {
                Column::Continuous(values) => {
                    draw_continuous(values, missing, x.view(), config, &mut rng)?;
                }
                Column::Categorical(factor) => {
                    let codes: Vec<usize> = factor.codes().iter().map(|c| c.unwrap_or(0)).collect();
                    let drawn = draw_categorical(&codes, factor.levels().len(), missing, x.view(), &mut rng)?;
                    for (&row, code) in missing.iter().zip(drawn) {
                        factor.set_code(row, code);
                    }
                }
            }
        }
        debug!("chain seeded {seed}: finished cycle {}", cycle + 1);
    }

    Ok(work)
}

/// Nelson-Aalen cumulative hazard at each subject's own follow-up time.
pub fn nelson_aalen(times: &[f64], events: &[bool]) -> Vec<f64> {
    let n = times.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

    let mut hazard = vec![0.0; n];
    let mut cumulative = 0.0;
    let mut at_risk = n;
    let mut start = 0;
    while start < n {
        let time = times[order[start]];
        let mut end = start;
        while end < n && times[order[end]] == time {
            end += 1;
        }
        let deaths = order[start..end].iter().filter(|&&i| events[i]).count();
        cumulative += deaths as f64 / at_risk as f64;
        for &i in &order[start..end] {
            hazard[i] = cumulative;
        }
        at_risk -= end - start;
        start = end;
    }
    hazard
}

/// fill missing entries with random observed values
fn initialise<R: Rng>(table: &mut Table, name: &str, missing: &[usize], rng: &mut R) -> Result<()> {
    let no_observed = || {
        SurvivalError::invalid_survival_data(format!("column '{name}' has no observed values to impute from"))
    };

    match table.column_mut(name)? {
        Column::Continuous(values) => {
            let observed: Vec<f64> = values.iter().flatten().copied().collect();
            if observed.is_empty() {
                return Err(no_observed());
            }
            for &row in missing {
                values[row] = Some(observed[rng.gen_range(0..observed.len())]);
            }
        }
        Column::Categorical(factor) => {
            let observed: Vec<usize> = factor.codes().iter().flatten().copied().collect();
            if observed.is_empty() {
                return Err(no_observed());
            }
            for &row in missing {
                let code = observed[rng.gen_range(0..observed.len())];
                factor.set_code(row, code);
            }
        }
    }
    Ok(())
}

/// intercept + every other column (standardised / reference-coded), constants dropped
fn predictor_matrix(table: &Table, target: &str, outcome: &[Vec<f64>]) -> Array2<f64> {
    let n = table.n_rows();
    let mut columns: Vec<Vec<f64>> = vec![vec![1.0; n]];

    let mut push_standardised = |values: Vec<f64>| {
        let mean = values.iter().sum::<f64>() / n as f64;
        let sd = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        if sd > 0.0 {
            columns.push(values.iter().map(|v| (v - mean) / sd).collect());
        }
    };

    for (name, column) in table.columns() {
        if name == target {
            continue;
        }
        match column {
            Column::Continuous(values) => push_standardised(values.iter().map(|v| v.unwrap_or(0.0)).collect()),
            Column::Categorical(factor) => {
                for level in 0..factor.levels().len() {
                    if level == factor.reference() {
                        continue;
                    }
                    let indicator: Vec<f64> =
                        factor.codes().iter().map(|c| if *c == Some(level) { 1.0 } else { 0.0 }).collect();
                    if indicator.iter().any(|&v| v > 0.0) && indicator.iter().any(|&v| v == 0.0) {
                        push_standardised(indicator);
                    }
                }
            }
        }
    }
    for values in outcome {
        push_standardised(values.clone());
    }

    let mut x = Array2::zeros((n, columns.len()));
    for (j, values) in columns.into_iter().enumerate() {
        x.column_mut(j).assign(&Array1::from(values));
    }
    x
}

fn complement(missing: &[usize], n: usize) -> Vec<usize> {
    let mut is_missing = vec![false; n];
    for &r in missing {
        is_missing[r] = true;
    }
    (0..n).filter(|&r| !is_missing[r]).collect()
}

fn standard_normals<R: Rng>(rng: &mut R, len: usize) -> Array1<f64> {
    (0..len).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()
}

/// Bayesian linear regression draw, then predictive mean matching.
fn draw_continuous<R: Rng>(
    values: &mut [Option<f64>],
    missing: &[usize],
    x: ArrayView2<f64>,
    config: &ImputationConfig,
    rng: &mut R,
) -> Result<()> {
    let observed = complement(missing, values.len());
    let q = x.ncols();
    if observed.len() <= q {
        return Err(SurvivalError::numerical_error(format!(
            "{} observed values cannot support {q} imputation predictors",
            observed.len()
        )));
    }

    let x_obs = x.select(ndarray::Axis(0), &observed);
    let y_obs: Array1<f64> = observed.iter().map(|&r| values[r].unwrap_or(0.0)).collect();

    let mut xtx = x_obs.t().dot(&x_obs);
    for j in 0..q {
        let diagonal = xtx[[j, j]];
        xtx[[j, j]] += config.ridge * diagonal;
    }
    let v = linalg::inverse_spd(xtx.view())?;
    let beta_hat = v.dot(&x_obs.t().dot(&y_obs));

    let residuals = &y_obs - &x_obs.dot(&beta_hat);
    let rss = residuals.dot(&residuals);
    let df = (observed.len() - q) as f64;
    let chi2 = ChiSquared::new(df).map_err(|e| SurvivalError::numerical_error(e.to_string()))?;
    let sigma = (rss / chi2.sample(rng)).sqrt();

    let l = linalg::cholesky(v.view())?;
    let beta_star = &beta_hat + &(l.dot(&standard_normals(rng, q)) * sigma);

    // type 1 matching: observed predicted with beta_hat, missing with the draw
    let yhat_obs = x_obs.dot(&beta_hat);
    let donors = config.donors.min(observed.len());
    let mut ranked: Vec<usize> = (0..observed.len()).collect();
    for &row in missing {
        let target = x.row(row).dot(&beta_star);
        ranked.sort_by(|&a, &b| (yhat_obs[a] - target).abs().total_cmp(&(yhat_obs[b] - target).abs()));
        let donor = ranked[rng.gen_range(0..donors)];
        values[row] = Some(y_obs[donor]);
    }
    Ok(())
}

/// class probabilities for one row; class 0 is the baseline
fn softmax(row: ArrayView1<f64>, coefficients: &Array2<f64>) -> Vec<f64> {
    let mut eta: Vec<f64> = std::iter::once(0.0)
        .chain(coefficients.rows().into_iter().map(|b| row.dot(&b)))
        .collect();
    let max = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0.0;
    for e in &mut eta {
        *e = (*e - max).exp();
        total += *e;
    }
    eta.iter().map(|e| e / total).collect()
}

/// penalised multinomial log-likelihood
fn logit_objective(x: ArrayView2<f64>, y: &[usize], coefficients: &Array2<f64>) -> f64 {
    let mut value = 0.0;
    for (i, &class) in y.iter().enumerate() {
        value += softmax(x.row(i), coefficients)[class].max(f64::MIN_POSITIVE).ln();
    }
    value - 0.5 * LOGIT_PRIOR_PRECISION * coefficients.iter().map(|b| b * b).sum::<f64>()
}

/// gradient and negative hessian of the penalised log-likelihood, flattened by class
fn logit_derivatives(x: ArrayView2<f64>, y: &[usize], coefficients: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let (k1, q) = coefficients.dim();
    let size = k1 * q;
    let mut gradient = Array1::<f64>::zeros(size);
    let mut information = Array2::<f64>::zeros((size, size));

    for (i, &class) in y.iter().enumerate() {
        let xi = x.row(i);
        let probs = softmax(xi, coefficients);
        for c in 0..k1 {
            let indicator = if class == c + 1 { 1.0 } else { 0.0 };
            let pc = probs[c + 1];
            for j in 0..q {
                gradient[c * q + j] += xi[j] * (indicator - pc);
            }
            for d in 0..k1 {
                let delta = if c == d { 1.0 } else { 0.0 };
                let w = pc * (delta - probs[d + 1]);
                if w == 0.0 {
                    continue;
                }
                for j in 0..q {
                    for k in 0..q {
                        information[[c * q + j, d * q + k]] += w * xi[j] * xi[k];
                    }
                }
            }
        }
    }

    for (idx, b) in coefficients.iter().enumerate() {
        gradient[idx] -= LOGIT_PRIOR_PRECISION * b;
        information[[idx, idx]] += LOGIT_PRIOR_PRECISION;
    }
    (gradient, information)
}

/// posterior mode of the multinomial logit by damped newton
fn fit_logit(x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<(Array2<f64>, Array2<f64>)> {
    let q = x.ncols();
    let mut coefficients = Array2::<f64>::zeros((n_classes - 1, q));
    let mut objective = logit_objective(x, y, &coefficients);

    for _ in 0..LOGIT_MAX_ITERATIONS {
        let (gradient, information) = logit_derivatives(x, y, &coefficients);
        let mut step = linalg::solve(information.view(), gradient.view())?
            .into_shape_with_order((n_classes - 1, q))
            .map_err(|e| SurvivalError::numerical_error(e.to_string()))?;

        let mut accepted = false;
        for _ in 0..20 {
            let candidate = &coefficients + &step;
            let value = logit_objective(x, y, &candidate);
            if value.is_finite() && value >= objective - 1e-12 * objective.abs().max(1.0) {
                coefficients = candidate;
                objective = value;
                accepted = true;
                break;
            }
            step /= 2.0;
        }

        let largest = step.iter().fold(0.0_f64, |m, s| m.max(s.abs()));
        if !accepted || largest < LOGIT_TOLERANCE {
            break;
        }
    }

    let (_, information) = logit_derivatives(x, y, &coefficients);
    Ok((coefficients, information))
}

/// Logistic draw for a categorical column; returns codes for the missing rows.
fn draw_categorical<R: Rng>(
    codes: &[usize],
    n_levels: usize,
    missing: &[usize],
    x: ArrayView2<f64>,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let observed = complement(missing, codes.len());

    // model only the levels seen among observed rows
    let mut seen = vec![false; n_levels];
    for &r in &observed {
        seen[codes[r]] = true;
    }
    let classes: Vec<usize> = (0..n_levels).filter(|&l| seen[l]).collect();
    if classes.len() == 1 {
        return Ok(vec![classes[0]; missing.len()]);
    }
    let class_of = |code: usize| classes.iter().position(|&c| c == code).unwrap_or(0);

    let x_obs = x.select(ndarray::Axis(0), &observed);
    let y: Vec<usize> = observed.iter().map(|&r| class_of(codes[r])).collect();
    let (mode, information) = fit_logit(x_obs.view(), &y, classes.len())?;

    let covariance = linalg::inverse_spd(information.view())?;
    let l = linalg::cholesky(covariance.view())?;
    let shift = l.dot(&standard_normals(rng, mode.len()));
    let draw = &mode
        + &shift
            .into_shape_with_order(mode.dim())
            .map_err(|e| SurvivalError::numerical_error(e.to_string()))?;

    let mut drawn = Vec::with_capacity(missing.len());
    for &row in missing {
        let probs = softmax(x.row(row), &draw);
        let u: f64 = rng.r#gen();
        let mut cumulative = 0.0;
        let mut pick = classes.len() - 1;
        for (c, p) in probs.iter().enumerate() {
            cumulative += p;
            if u < cumulative {
                pick = c;
                break;
            }
        }
        drawn.push(classes[pick]);
    }
    Ok(drawn)
}
