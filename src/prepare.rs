use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{PrepareConfig, WHO_BMI_BREAKS},
    error::{Result, SurvivalError},
    table::{Column, Factor, Table},
};

pub const SMOKING_LEVELS: [&str; 3] = ["never", "<10 PY", ">=10 PY"];
pub const CURRENT_SMOKING_LEVELS: [&str; 2] = ["no", "yes"];
pub const SEX_LEVELS: [&str; 2] = ["male", "female"];
pub const SITE_LEVELS: [&str; 5] = ["oral cavity", "oropharynx", "hypopharynx", "larynx", "other"];
pub const GRADE_LEVELS: [&str; 3] = ["G1", "G2", "G3"];
pub const STAGE_LEVELS: [&str; 4] = ["I", "II", "III", "IV"];
pub const HPV_LEVELS: [&str; 2] = ["negative", "positive"];

/// one subject as parsed by the external loader
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPatient {
    pub age: Option<f64>,                // years at diagnosis
    pub sex: Option<String>,
    pub site: Option<String>,
    pub grade: Option<i64>,              // 1..=3
    pub stage: Option<String>,           // I..IVC
    pub bmi: Option<f64>,
    pub smoking_history: Option<i64>,    // 0 never, 1 <10 PY, 2 >=10 PY
    pub current_smoker: Option<i64>,     // 0/1
    pub hpv: Option<i64>,                // 0 negative, 1 positive
    pub followup_months: Option<f64>,
    pub event: Option<i64>,              // 1 = died, 0 = alive at last contact
}

/// how many values per column fell outside their domain
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecodeReport {
    pub out_of_domain: BTreeMap<String, usize>,
}

impl RecodeReport {
    fn note(&mut self, column: &str, row: usize, value: impl std::fmt::Debug) {
        warn!("row {row}: {column} value {value:?} is out of domain, recoded as missing");
        *self.out_of_domain.entry(column.to_string()).or_default() += 1;
    }

    pub fn total(&self) -> usize {
        self.out_of_domain.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedCohort {
    pub table: Table,
    pub report: RecodeReport,
}

/// recode raw records into a table; out-of-domain codes become missing and are counted
pub fn prepare(records: &[RawPatient], config: &PrepareConfig) -> Result<PreparedCohort> {
    config.validate()?;
    let mut report = RecodeReport::default();
    let (times, events) = outcome(records)?;

    let smoking = recode(records, "smoking", &mut report, |r| {
        r.smoking_history.map(|c| usize::try_from(c).ok().filter(|&c| c < 3).ok_or(c))
    });
    let current = recode(records, "current_smoking", &mut report, |r| {
        r.current_smoker.map(|c| usize::try_from(c).ok().filter(|&c| c < 2).ok_or(c))
    });
    let sex = recode(records, "sex", &mut report, |r| {
        r.sex.as_deref().map(|s| sex_level(s).ok_or(s.to_string()))
    });
    let site = recode(records, "site", &mut report, |r| {
        r.site.as_deref().map(|s| site_level(s).ok_or(s.to_string()))
    });
    let grade = recode(records, "grade", &mut report, |r| {
        r.grade.map(|g| {
            usize::try_from(g)
                .ok()
                .and_then(|g| g.checked_sub(1))
                .filter(|&g| g < 3)
                .ok_or(g)
        })
    });
    let stage = recode(records, "stage", &mut report, |r| {
        r.stage.as_deref().map(|s| stage_level(s).ok_or(s.to_string()))
    });

    let ages = finite_values(records, "age", &mut report, |r| r.age);
    let bmis = finite_values(records, "bmi", &mut report, |r| r.bmi);

    let age_labels = bin_labels(&config.age_breaks);
    let bmi_labels = if config.bmi_breaks == WHO_BMI_BREAKS {
        vec!["underweight", "normal", "overweight", "obese"]
            .into_iter()
            .map(String::from)
            .collect()
    } else {
        bin_labels(&config.bmi_breaks)
    };
    let age_group = ages.iter().map(|a| a.map(|v| bin(v, &config.age_breaks))).collect();
    let bmi_category = bmis.iter().map(|b| b.map(|v| bin(v, &config.bmi_breaks))).collect();

    let mut table = Table::new(times, events)?
        .with_column("smoking", categorical(&SMOKING_LEVELS, smoking)?)?
        .with_column("current_smoking", categorical(&CURRENT_SMOKING_LEVELS, current)?)?
        .with_column("age", Column::Continuous(ages))?
        .with_column("age_group", Column::Categorical(Factor::new(age_labels, age_group)?))?
        .with_column("sex", categorical(&SEX_LEVELS, sex)?)?
        .with_column("site", categorical(&SITE_LEVELS, site)?)?
        .with_column("grade", categorical(&GRADE_LEVELS, grade)?)?
        .with_column("stage", categorical(&STAGE_LEVELS, stage)?)?
        .with_column("bmi", Column::Continuous(bmis))?
        .with_column("bmi_category", Column::Categorical(Factor::new(bmi_labels, bmi_category)?))?;

    if records.iter().any(|r| r.hpv.is_some()) {
        let hpv = recode(records, "hpv", &mut report, |r| {
            r.hpv.map(|c| usize::try_from(c).ok().filter(|&c| c < 2).ok_or(c))
        });
        table.push_column("hpv", categorical(&HPV_LEVELS, hpv)?)?;
    }

    info!(
        "prepared {} subjects ({} events), {} out-of-domain values recoded as missing",
        table.n_rows(),
        table.events().iter().filter(|&&e| e).count(),
        report.total()
    );

    Ok(PreparedCohort { table, report })
}

/// follow-up and vital status are required for every subject
fn outcome(records: &[RawPatient]) -> Result<(Vec<f64>, Vec<bool>)> {
    let mut times = Vec::with_capacity(records.len());
    let mut events = Vec::with_capacity(records.len());

    for (row, r) in records.iter().enumerate() {
        let time = r
            .followup_months
            .ok_or_else(|| SurvivalError::missing_value("followup_months", row))?;
        let event = match r.event {
            Some(0) => false,
            Some(1) => true,
            Some(code) => {
                return Err(SurvivalError::invalid_survival_data(format!(
                    "row {row}: event code {code} is not 0 or 1"
                )));
            }
            None => return Err(SurvivalError::missing_value("event", row)),
        };
        times.push(time);
        events.push(event);
    }

    Ok((times, events))
}

fn recode<F, E>(
    records: &[RawPatient],
    column: &str,
    report: &mut RecodeReport,
    code: F,
) -> Vec<Option<usize>>
where
    F: Fn(&RawPatient) -> Option<std::result::Result<usize, E>>,
    E: std::fmt::Debug,
{
    records
        .iter()
        .enumerate()
        .map(|(row, r)| match code(r) {
            None => None,
            Some(Ok(level)) => Some(level),
            Some(Err(raw)) => {
                report.note(column, row, raw);
                None
            }
        })
        .collect()
}

fn finite_values<F>(
    records: &[RawPatient],
    column: &str,
    report: &mut RecodeReport,
    value: F,
) -> Vec<Option<f64>>
where
    F: Fn(&RawPatient) -> Option<f64>,
{
    records
        .iter()
        .enumerate()
        .map(|(row, r)| match value(r) {
            Some(v) if v.is_finite() && v >= 0.0 => Some(v),
            Some(v) => {
                report.note(column, row, v);
                None
            }
            None => None,
        })
        .collect()
}

fn categorical(levels: &[&str], codes: Vec<Option<usize>>) -> Result<Column> {
    Ok(Column::Categorical(Factor::new(
        levels.iter().map(|l| l.to_string()).collect(),
        codes,
    )?))
}

fn normalise(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

fn sex_level(label: &str) -> Option<usize> {
    match normalise(label).as_str() {
        "m" | "male" => Some(0),
        "f" | "female" => Some(1),
        _ => None,
    }
}

fn site_level(label: &str) -> Option<usize> {
    match normalise(label).as_str() {
        "oral cavity" | "oral" => Some(0),
        "oropharynx" => Some(1),
        "hypopharynx" => Some(2),
        "larynx" => Some(3),
        "other" => Some(4),
        _ => None,
    }
}

/// sub-stages collapse onto their parent stage: IVA/IVB/IVC -> IV
pub fn stage_level(label: &str) -> Option<usize> {
    let label = normalise(label);
    let label = label.strip_prefix("stage").unwrap_or(&label).trim();
    let roman = label.trim_end_matches(['a', 'b', 'c']);
    match roman {
        "i" => Some(0),
        "ii" => Some(1),
        "iii" => Some(2),
        "iv" => Some(3),
        _ => None,
    }
}

/// index of the left-closed bin containing `value`
pub fn bin(value: f64, breaks: &[f64]) -> usize {
    breaks.iter().take_while(|&&b| value >= b).count()
}

/// `<b0`, `b0-b1`, ..., `>=bk`; integral breaks render as closed year ranges
pub fn bin_labels(breaks: &[f64]) -> Vec<String> {
    let (Some(first), Some(last)) = (breaks.first(), breaks.last()) else {
        return vec!["all".to_string()];
    };
    let integral = breaks.iter().all(|b| b.fract() == 0.0);
    let mut labels = Vec::with_capacity(breaks.len() + 1);
    labels.push(format!("<{first}"));
    for w in breaks.windows(2) {
        if integral {
            labels.push(format!("{}-{}", w[0], w[1] - 1.0));
        } else {
            labels.push(format!("[{},{})", w[0], w[1]));
        }
    }
    labels.push(format!(">={last}"));
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(time: f64, event: i64) -> RawPatient {
        RawPatient {
            age: Some(58.0),
            sex: Some("M".into()),
            site: Some("Oropharynx".into()),
            grade: Some(2),
            stage: Some("IVA".into()),
            bmi: Some(24.9),
            smoking_history: Some(2),
            current_smoker: Some(0),
            hpv: None,
            followup_months: Some(time),
            event: Some(event),
        }
    }

    #[test]
    fn test_stage_collapse() {
        assert_eq!(stage_level("IVA"), Some(3));
        assert_eq!(stage_level("ivb"), Some(3));
        assert_eq!(stage_level("Stage IVC"), Some(3));
        assert_eq!(stage_level(" III "), Some(2));
        assert_eq!(stage_level("I"), Some(0));
        assert_eq!(stage_level("V"), None);
        assert_eq!(stage_level("X"), None);
    }

    #[test]
    fn test_bins() {
        let breaks = [50.0, 60.0, 70.0];
        assert_eq!(bin(49.9, &breaks), 0);
        assert_eq!(bin(50.0, &breaks), 1);
        assert_eq!(bin(69.9, &breaks), 2);
        assert_eq!(bin(85.0, &breaks), 3);
        assert_eq!(bin_labels(&breaks), vec!["<50", "50-59", "60-69", ">=70"]);
        assert_eq!(bin_labels(&[18.5, 25.0]), vec!["<18.5", "[18.5,25)", ">=25"]);
    }

    #[test]
    fn test_prepare_recodes() {
        let records = vec![patient(12.0, 1), patient(30.5, 0)];
        let cohort = prepare(&records, &PrepareConfig::default()).unwrap();
        let t = &cohort.table;

        assert_eq!(t.n_rows(), 2);
        assert_eq!(t.events(), &[true, false]);
        assert_eq!(t.factor("smoking").unwrap().label(0), Some(">=10 PY"));
        assert_eq!(t.factor("stage").unwrap().label(0), Some("IV"));
        assert_eq!(t.factor("age_group").unwrap().label(0), Some("50-59"));
        assert_eq!(t.factor("bmi_category").unwrap().label(0), Some("normal"));
        assert_eq!(t.factor("site").unwrap().label(1), Some("oropharynx"));
        assert!(t.column("hpv").is_err());
        assert_eq!(cohort.report.total(), 0);
    }

    #[test]
    fn test_out_of_domain_becomes_missing() {
        let mut bad = patient(5.0, 1);
        bad.smoking_history = Some(3);
        bad.grade = Some(9);
        bad.sex = Some("unknown".into());
        let records = vec![patient(12.0, 1), bad];

        let cohort = prepare(&records, &PrepareConfig::default()).unwrap();
        let t = &cohort.table;
        assert_eq!(t.factor("smoking").unwrap().label(1), None);
        assert_eq!(t.factor("grade").unwrap().label(1), None);
        assert_eq!(t.factor("sex").unwrap().label(1), None);
        assert_eq!(cohort.report.out_of_domain["smoking"], 1);
        assert_eq!(cohort.report.total(), 3);
    }

    #[test]
    fn test_missing_outcome_is_error() {
        let mut bad = patient(5.0, 1);
        bad.followup_months = None;
        let err = prepare(&[bad], &PrepareConfig::default()).unwrap_err();
        assert!(matches!(err, SurvivalError::MissingValue { row: 0, .. }));

        let mut bad = patient(5.0, 1);
        bad.event = Some(2);
        assert!(prepare(&[bad], &PrepareConfig::default()).is_err());
    }

    #[test]
    fn test_hpv_column_when_present() {
        let mut a = patient(12.0, 1);
        a.hpv = Some(1);
        let b = patient(3.0, 0);
        let cohort = prepare(&[a, b], &PrepareConfig::default()).unwrap();
        let hpv = cohort.table.factor("hpv").unwrap();
        assert_eq!(hpv.label(0), Some("positive"));
        assert_eq!(hpv.label(1), None);
        assert_eq!(cohort.table.incomplete_columns(), vec!["hpv"]);
    }

    #[test]
    fn test_bad_breaks_rejected() {
        let records = vec![patient(12.0, 1)];
        let empty = PrepareConfig { age_breaks: vec![], ..PrepareConfig::default() };
        let err = prepare(&records, &empty).unwrap_err();
        assert!(matches!(err, SurvivalError::InvalidParameter { .. }));

        let unsorted = PrepareConfig { bmi_breaks: vec![30.0, 18.5, 25.0], ..PrepareConfig::default() };
        assert!(matches!(prepare(&records, &unsorted), Err(SurvivalError::InvalidParameter { .. })));
        assert_eq!(bin_labels(&[]), vec!["all"]);
    }

    #[test]
    fn test_custom_bmi_breaks_get_range_labels() {
        let records = vec![patient(12.0, 1)];
        let config = PrepareConfig { bmi_breaks: vec![20.0, 25.0, 35.0], ..PrepareConfig::default() };
        let cohort = prepare(&records, &config).unwrap();
        let bmi = cohort.table.factor("bmi_category").unwrap();
        assert_eq!(bmi.levels(), &["<20", "20-24", "25-34", ">=35"]);
        assert_eq!(bmi.label(0), Some("20-24"));
    }
}
