#![allow(dead_code)]

use hnc_survival::{Column, Factor, Table};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const EXPOSURE_LEVELS: [&str; 3] = ["never", "light", "heavy"];

/// exact quantiles of an exponential with the given rate at (i + 0.5) / n
pub fn exponential_quantiles(n: usize, rate: f64) -> Vec<f64> {
    (0..n)
        .map(|i| -(1.0 - (i as f64 + 0.5) / n as f64).ln() / rate)
        .collect()
}

/// exact quantiles of a weibull(shape, scale 1) at (i + 0.5) / n
pub fn weibull_quantiles(n: usize, shape: f64) -> Vec<f64> {
    (0..n)
        .map(|i| (-(1.0 - (i as f64 + 0.5) / n as f64).ln()).powf(1.0 / shape))
        .collect()
}

/// two groups, uncensored, given event times per group
pub fn two_group_table(group0: &[f64], group1: &[f64]) -> Table {
    let times: Vec<f64> = group0.iter().chain(group1).copied().collect();
    let labels: Vec<Option<&str>> = group0
        .iter()
        .map(|_| Some("control"))
        .chain(group1.iter().map(|_| Some("treated")))
        .collect();
    let group = Factor::from_labels(&["control", "treated"], &labels).unwrap();
    Table::new(times.clone(), vec![true; times.len()])
        .unwrap()
        .with_column("group", Column::Categorical(group))
        .unwrap()
}

/// Cohort with a 3-level exposure and age driving an exponential hazard,
/// uniform censoring between 12 and 60 months. Each covariate value is
/// dropped with probability `missing_rate`.
pub fn synthetic_cohort(n: usize, missing_rate: f64, seed: u64) -> Table {
    let mut rng = StdRng::seed_from_u64(seed);
    let rates = [0.02, 0.035, 0.06];

    let mut times = Vec::with_capacity(n);
    let mut events = Vec::with_capacity(n);
    let mut exposure = Vec::with_capacity(n);
    let mut age = Vec::with_capacity(n);

    for i in 0..n {
        let level = i % 3;
        let years: f64 = rng.gen_range(40.0..80.0);
        let hazard = rates[level] * (0.04 * (years - 60.0)).exp();
        let time = (-(1.0 - rng.r#gen::<f64>()).ln() / hazard).max(0.1);
        let censoring_time = rng.gen_range(12.0..60.0);

        if time < censoring_time {
            times.push(time);
            events.push(true);
        } else {
            times.push(censoring_time);
            events.push(false);
        }

        let drop_exposure = rng.r#gen::<f64>() < missing_rate;
        let drop_age = rng.r#gen::<f64>() < missing_rate;
        exposure.push(if drop_exposure { None } else { Some(EXPOSURE_LEVELS[level]) });
        age.push(if drop_age { None } else { Some(years) });
    }

    Table::new(times, events)
        .unwrap()
        .with_column(
            "exposure",
            Column::Categorical(Factor::from_labels(&EXPOSURE_LEVELS, &exposure).unwrap()),
        )
        .unwrap()
        .with_column("age", Column::Continuous(age))
        .unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
