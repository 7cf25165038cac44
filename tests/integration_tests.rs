mod common;

use approx::assert_relative_eq;
use common::{exponential_quantiles, synthetic_cohort, two_group_table, weibull_quantiles};
use hnc_survival::{
    AnalysisConfig, Column, CompleteCaseAnalysis, CoxSpec, MultipleImputationAnalysis, RawPatient,
    SurvivalError, Table, TieMethod,
    config::{CoxConfig, ImputationConfig},
    diagnostics::{self, TimeTransform},
    imputation,
    kaplan_meier::kaplan_meier,
    pipeline::{self, fit_cox},
    pooling::PoolPolicy,
    prepare,
};
use std::io::Write;

#[test]
fn test_end_to_end_three_level_exposure() {
    common::init_logging();
    let table = synthetic_cohort(215, 0.0, 2024);
    assert!(table.is_complete());
    assert!(table.times().iter().all(|&t| t > 0.0));

    let report = CompleteCaseAnalysis::default()
        .run(&table, &CoxSpec::new(&["exposure"]))
        .unwrap();

    assert_eq!(report.n_used, 215);
    let estimates = report.fit.estimates();
    assert_eq!(estimates.len(), 2); // reference-coded: light, heavy vs never
    assert_eq!(report.fit.term_names(), vec!["exposure[light]", "exposure[heavy]"]);
    for estimate in &estimates {
        assert!(estimate.hazard_ratio > 0.0);
        assert!(estimate.lower.is_finite() && estimate.upper.is_finite());
        assert!(estimate.lower < estimate.hazard_ratio && estimate.hazard_ratio < estimate.upper);
    }
    assert_eq!(report.ph.covariates.len(), 2);
}

#[test]
fn test_hazard_ratio_matches_exponential_model() {
    // rate 2 vs rate 1, no censoring
    let control = exponential_quantiles(200, 1.0);
    let treated = exponential_quantiles(200, 2.0);
    let mle_ratio = (treated.len() as f64 / treated.iter().sum::<f64>())
        / (control.len() as f64 / control.iter().sum::<f64>());
    assert_relative_eq!(mle_ratio, 2.0, epsilon = 1e-9);

    let table = two_group_table(&control, &treated);
    for ties in [TieMethod::Efron, TieMethod::Breslow] {
        let config = CoxConfig { ties, ..CoxConfig::default() };
        let (_, fit) = fit_cox(&table, &CoxSpec::new(&["group"]), &config).unwrap();
        let hr = fit.hazard_ratios()[0];
        assert!((hr / mle_ratio - 1.0).abs() < 0.1, "hazard ratio {hr} vs {mle_ratio}");
        let (lower, upper) = fit.confidence_intervals()[0];
        assert!(lower < 2.0 && 2.0 < upper);
    }
}

#[test]
fn test_single_level_stratum_matches_unstratified() {
    let table = synthetic_cohort(150, 0.0, 5);
    let n = table.n_rows();
    let centre = hnc_survival::Factor::from_labels(&["A"], &vec![Some("A"); n]).unwrap();
    let table = table.with_column("centre", Column::Categorical(centre)).unwrap();

    let config = CoxConfig::default();
    let spec = CoxSpec::new(&["exposure", "age"]);
    let (_, plain) = fit_cox(&table, &spec, &config).unwrap();
    let (_, stratified) = fit_cox(&table, &spec.clone().stratified_by(&["centre"]), &config).unwrap();

    for (a, b) in plain.coefficients().iter().zip(stratified.coefficients()) {
        assert_relative_eq!(a, b, epsilon = 1e-10);
    }
    assert_relative_eq!(plain.loglik(), stratified.loglik(), epsilon = 1e-10);
}

#[test]
fn test_stratified_fit_shares_coefficients() {
    let table = synthetic_cohort(300, 0.0, 17);
    let n = table.n_rows();
    let labels: Vec<Option<&str>> = (0..n).map(|i| Some(if i % 2 == 0 { "north" } else { "south" })).collect();
    let centre = hnc_survival::Factor::from_labels(&["north", "south"], &labels).unwrap();
    let table = table.with_column("centre", Column::Categorical(centre)).unwrap();

    let (data, fit) = fit_cox(&table, &CoxSpec::new(&["exposure"]).stratified_by(&["centre"]), &CoxConfig::default()).unwrap();
    assert_eq!(data.n_strata(), 2);
    assert!(fit.is_stratified());
    assert_eq!(fit.coefficients().len(), 2);
    assert!(fit.concordance().is_some());
}

#[test]
fn test_schoenfeld_accepts_proportional_hazards() {
    let table = two_group_table(&exponential_quantiles(150, 1.0), &exponential_quantiles(150, 2.0));
    let (data, fit) = fit_cox(&table, &CoxSpec::new(&["group"]), &CoxConfig::default()).unwrap();

    for transform in [TimeTransform::KaplanMeier, TimeTransform::Rank, TimeTransform::Log] {
        let ph = diagnostics::proportional_hazards_test(&data, &fit, transform, 0.05).unwrap();
        assert!(ph.global.p_value > 0.05, "{transform:?}: p = {}", ph.global.p_value);
        assert!(!ph.violated());
        assert!(ph.remediation().is_empty());
    }
}

#[test]
fn test_schoenfeld_detects_crossing_hazards() {
    // weibull shape 0.4: hazard far above the exponential early, below it late
    let control = exponential_quantiles(150, 1.0);
    let treated = weibull_quantiles(150, 0.4);
    let table = two_group_table(&control, &treated);
    let (data, fit) = fit_cox(&table, &CoxSpec::new(&["group"]), &CoxConfig::default()).unwrap();

    let ph = diagnostics::proportional_hazards_test(&data, &fit, TimeTransform::KaplanMeier, 0.05).unwrap();
    assert!(ph.global.p_value < 0.05, "p = {}", ph.global.p_value);
    assert!(ph.covariates[0].violated);
    assert!(ph.covariates[0].correlation < 0.0); // effect fades with time
    assert_eq!(ph.remediation(), vec!["group".to_string()]);
}

#[test]
fn test_complete_case_refits_stratified_on_violation() {
    common::init_logging();
    let control = exponential_quantiles(150, 1.0);
    let treated = weibull_quantiles(150, 0.4);
    let table = two_group_table(&control, &treated);
    let score: Vec<Option<f64>> = (0..table.n_rows()).map(|i| Some(((i * 7) % 20) as f64)).collect();
    let table = table.with_column("score", Column::Continuous(score)).unwrap();

    let report = CompleteCaseAnalysis::default()
        .run(&table, &CoxSpec::new(&["group", "score"]))
        .unwrap();

    assert!(report.ph.violated());
    let refit = report.stratified.expect("group violates PH and should be stratified");
    assert_eq!(refit.spec.covariates, vec!["score"]);
    assert_eq!(refit.spec.strata, vec!["group"]);
    assert_eq!(refit.fit.stratum_labels(), &["control".to_string(), "treated".to_string()]);
}

#[test]
fn test_kaplan_meier_matches_empirical_survival() {
    let control = exponential_quantiles(40, 1.0);
    let treated = exponential_quantiles(30, 2.0);
    let table = two_group_table(&control, &treated);
    let km = kaplan_meier(&table, Some("group"), 0.95).unwrap();

    for (curve, times) in km.curves.iter().zip([&control, &treated]) {
        assert_relative_eq!(curve.survival_at(0.0), 1.0);
        let mut previous = 1.0;
        for step in &curve.steps {
            let alive = times.iter().filter(|&&t| t > step.time).count() as f64;
            assert_relative_eq!(step.survival, alive / times.len() as f64, epsilon = 1e-12);
            assert!(step.survival <= previous);
            previous = step.survival;
        }
        assert!(curve.median().is_some());
    }
    assert!(km.log_rank.as_ref().unwrap().p_value < 0.05);
}

#[test]
fn test_log_rank_identical_groups() {
    let times = exponential_quantiles(50, 1.0);
    let table = two_group_table(&times, &times);
    let km = kaplan_meier(&table, Some("group"), 0.95).unwrap();
    let test = km.log_rank.unwrap();

    assert_relative_eq!(test.statistic, 0.0, epsilon = 1e-10);
    assert!(test.p_value > 0.99);
}

#[test]
fn test_design_problems_rejected() {
    let table = synthetic_cohort(60, 0.0, 3);
    let age: Vec<Option<f64>> = table.continuous("age").unwrap().to_vec();
    let doubled = age.iter().map(|a| a.map(|v| 2.0 * v)).collect();
    let table = table
        .with_column("age_doubled", Column::Continuous(doubled))
        .unwrap()
        .with_column("site_code", Column::Continuous(vec![Some(1.0); 60]))
        .unwrap();

    let config = CoxConfig::default();
    let err = fit_cox(&table, &CoxSpec::new(&["age", "age_doubled"]), &config).unwrap_err();
    assert!(matches!(err, SurvivalError::RankDeficient { rank: 1, columns: 2 }));

    let err = fit_cox(&table, &CoxSpec::new(&["exposure", "site_code"]), &config).unwrap_err();
    assert!(matches!(err, SurvivalError::ConstantCovariate { ref term } if term == "site_code"));
}

#[test]
fn test_multiple_imputation_with_one_dataset_fails() {
    let table = synthetic_cohort(100, 0.2, 9);
    let mut config = AnalysisConfig::default();
    config.imputation.imputations = 1;

    let result = MultipleImputationAnalysis::new(config).run(&table, &CoxSpec::new(&["exposure", "age"]));
    assert!(matches!(result, Err(SurvivalError::InsufficientImputations { m: 1 })));
}

#[test]
fn test_imputed_tables_complete_and_observed_values_kept() {
    let table = synthetic_cohort(215, 0.15, 31);
    assert!(!table.is_complete());

    let config = ImputationConfig::default();
    let ensemble = imputation::impute(&table, &config).unwrap();
    assert_eq!(ensemble.len(), 5);

    let age = table.continuous("age").unwrap();
    let exposure = table.factor("exposure").unwrap().codes();
    for completed in ensemble.datasets() {
        assert!(completed.is_complete());
        assert_eq!(completed.times(), table.times());
        assert_eq!(completed.events(), table.events());
        for (row, value) in age.iter().enumerate() {
            if value.is_some() {
                assert_eq!(completed.continuous("age").unwrap()[row], *value);
            }
        }
        for (row, code) in exposure.iter().enumerate() {
            if code.is_some() {
                assert_eq!(completed.factor("exposure").unwrap().codes()[row], *code);
            }
        }
    }
}

#[test]
fn test_imputation_is_reproducible() {
    let table = synthetic_cohort(120, 0.2, 4);
    let config = ImputationConfig { imputations: 3, ..ImputationConfig::default() };

    let first = imputation::impute(&table, &config).unwrap();
    let second = imputation::impute(&table, &config).unwrap();
    assert_eq!(first.datasets(), second.datasets());

    let other = imputation::impute(&table, &ImputationConfig { seed: config.seed + 100, ..config.clone() }).unwrap();
    assert_ne!(first.datasets(), other.datasets());
}

#[test]
fn test_multiple_imputation_pipeline_pools() {
    common::init_logging();
    let table = synthetic_cohort(215, 0.15, 77);
    let mut config = AnalysisConfig::default();
    config.imputation.pool_policy = PoolPolicy::ExcludeFailed;

    let report = MultipleImputationAnalysis::new(config)
        .run(&table, &CoxSpec::new(&["exposure", "age"]))
        .unwrap();

    assert_eq!(report.imputed_columns, vec!["exposure", "age"]);
    assert_eq!(report.fits.len(), 5);
    assert!(report.excluded.is_empty());
    assert_eq!(report.pooled.m, 5);
    assert_eq!(report.pooled.terms.len(), 3);

    for term in &report.pooled.terms {
        assert_relative_eq!(term.total, term.within + 1.2 * term.between, epsilon = 1e-12);
        assert!(term.hazard_ratio > 0.0 && term.lower < term.upper);
        assert!(term.df > 0.0 && term.fmi >= 0.0 && term.fmi <= 1.0);
    }
    let age = report.pooled.term("age").unwrap();
    assert!(age.estimate > 0.0); // hazard rises with age in the generator
}

#[test]
fn test_prepare_then_analyse() {
    let records: Vec<RawPatient> = (0..90)
        .map(|i| {
            let smoking = (i % 3) as i64;
            RawPatient {
                age: Some(40.0 + ((i * 13) % 40) as f64),
                sex: Some((if i % 2 == 0 { "M" } else { "F" }).into()),
                site: Some("larynx".into()),
                grade: Some((i % 3 + 1) as i64),
                stage: Some(["I", "II", "III", "IVB"][i % 4].into()),
                bmi: Some(18.0 + (i % 15) as f64),
                smoking_history: Some(if i == 5 { 7 } else { smoking }),
                current_smoker: Some((i % 2) as i64),
                hpv: None,
                followup_months: Some(5.0 + ((i * 37) % 50) as f64 / (1.0 + smoking as f64)),
                event: Some(if i % 4 == 0 { 0 } else { 1 }),
            }
        })
        .collect();

    let cohort = prepare(&records, &AnalysisConfig::default().prepare).unwrap();
    assert_eq!(cohort.report.out_of_domain.get("smoking"), Some(&1));
    assert_eq!(cohort.table.factor("stage").unwrap().counts(), vec![23, 23, 22, 22]);

    let comparison = pipeline::survival_by_factor(&cohort.table, "smoking", &AnalysisConfig::default()).unwrap();
    assert_eq!(comparison.km.excluded, 1);
    assert_eq!(comparison.km.curves.len(), 3);
    assert_eq!(comparison.cloglog.len(), 3);
    assert_eq!(comparison.km.log_rank.as_ref().unwrap().df, 2);

    let screen = pipeline::univariate_screen(&cohort.table, &["smoking", "age"], &CoxConfig::default()).unwrap();
    assert_eq!(screen[0].n_used, 89);
    assert_eq!(screen[0].estimates.len(), 2);
    assert_eq!(screen[1].estimates.len(), 1);
}

#[test]
fn test_config_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[cox]
ties = "breslow"
max_iterations = 30

[diagnostics]
transform = "rank"

[imputation]
imputations = 10
seed = 7
pool_policy = "exclude_failed"
"#
    )
    .unwrap();

    let config = AnalysisConfig::from_file(file.path()).unwrap();
    assert_eq!(config.cox.ties, TieMethod::Breslow);
    assert_eq!(config.cox.max_iterations, 30);
    assert_eq!(config.cox.tolerance, 1e-9);
    assert_eq!(config.diagnostics.transform, TimeTransform::Rank);
    assert_eq!(config.imputation.imputations, 10);
    assert_eq!(config.imputation.pool_policy, PoolPolicy::ExcludeFailed);
    assert_eq!(config.prepare.age_breaks, vec![50.0, 60.0, 70.0]);

    let err = AnalysisConfig::from_toml_str("[imputation]\nimputations = 1\n").unwrap_err();
    assert!(matches!(err, SurvivalError::InsufficientImputations { m: 1 }));
}

#[test]
fn test_table_round_trips_through_fit() {
    let table: Table = synthetic_cohort(80, 0.0, 12);
    let (data, fit) = fit_cox(&table, &CoxSpec::new(&["exposure", "age"]), &CoxConfig::default()).unwrap();
    let lp = fit.predict(data.covariates()).unwrap();
    assert_eq!(lp.len(), 80);
    assert!(fit.likelihood_ratio_test().statistic >= 0.0);
    assert!(fit.loglik() >= fit.null_loglik());
    let rendered = fit.table().to_string();
    assert!(rendered.contains("exposure[heavy]"));
}
