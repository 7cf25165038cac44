use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    diagnostics::TimeTransform,
    error::{Result, SurvivalError},
    optimization::TieMethod,
    pooling::PoolPolicy,
};

/// Top-level configuration for a full analysis run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub prepare: PrepareConfig,
    pub cox: CoxConfig,
    pub survival: SurvivalConfig,
    pub diagnostics: DiagnosticsConfig,
    pub imputation: ImputationConfig,
}

/// WHO adult BMI cut-offs
pub const WHO_BMI_BREAKS: [f64; 3] = [18.5, 25.0, 30.0];

/// bucketing breakpoints, left-closed: `[50, 60, 70]` -> `<50`, `50-59`, `60-69`, `>=70`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareConfig {
    pub age_breaks: Vec<f64>,
    pub bmi_breaks: Vec<f64>,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            age_breaks: vec![50.0, 60.0, 70.0],
            bmi_breaks: WHO_BMI_BREAKS.to_vec(),
        }
    }
}

impl PrepareConfig {
    /// breaks must be non-empty, finite and strictly increasing
    pub fn validate(&self) -> Result<()> {
        check_breaks("prepare.age_breaks", &self.age_breaks)?;
        check_breaks("prepare.bmi_breaks", &self.bmi_breaks)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoxConfig {
    pub ties: TieMethod,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub max_step_halvings: usize,
    pub confidence_level: f64,
    /// scaled condition number above which a collinearity warning is logged
    pub condition_warning: f64,
}

impl Default for CoxConfig {
    fn default() -> Self {
        Self {
            ties: TieMethod::Efron,
            tolerance: 1e-9,
            max_iterations: 50,
            max_step_halvings: 20,
            confidence_level: 0.95,
            condition_warning: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurvivalConfig {
    pub confidence_level: f64,
}

impl Default for SurvivalConfig {
    fn default() -> Self {
        Self { confidence_level: 0.95 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub transform: TimeTransform,
    pub significance_level: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            transform: TimeTransform::KaplanMeier,
            significance_level: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationConfig {
    /// number of completed datasets (M)
    pub imputations: usize,
    /// chained-equation sweeps per dataset
    pub cycles: usize,
    pub seed: u64,
    /// donor pool size for predictive mean matching
    pub donors: usize,
    /// add event indicator and Nelson-Aalen hazard as predictors
    pub include_outcome: bool,
    /// ridge added to normal equations of the conditional models
    pub ridge: f64,
    pub pool_policy: PoolPolicy,
}

impl Default for ImputationConfig {
    fn default() -> Self {
        Self {
            imputations: 5,
            cycles: 5,
            seed: 2024,
            donors: 5,
            include_outcome: true,
            ridge: 1e-5,
            pool_policy: PoolPolicy::Abort,
        }
    }
}

impl AnalysisConfig {
    /// parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// reject values no analysis could run with
    pub fn validate(&self) -> Result<()> {
        self.prepare.validate()?;

        if !(self.cox.tolerance > 0.0 && self.cox.tolerance.is_finite()) {
            return Err(SurvivalError::invalid_parameter("cox.tolerance", self.cox.tolerance));
        }
        if self.cox.max_iterations == 0 {
            return Err(SurvivalError::invalid_parameter("cox.max_iterations", 0));
        }
        check_level("cox.confidence_level", self.cox.confidence_level)?;
        check_level("survival.confidence_level", self.survival.confidence_level)?;
        check_level("diagnostics.significance_level", self.diagnostics.significance_level)?;

        let imp = &self.imputation;
        if imp.imputations < 2 {
            return Err(SurvivalError::InsufficientImputations { m: imp.imputations });
        }
        if imp.cycles == 0 {
            return Err(SurvivalError::invalid_parameter("imputation.cycles", 0));
        }
        if imp.donors == 0 {
            return Err(SurvivalError::invalid_parameter("imputation.donors", 0));
        }
        if !(imp.ridge >= 0.0 && imp.ridge.is_finite()) {
            return Err(SurvivalError::invalid_parameter("imputation.ridge", imp.ridge));
        }
        Ok(())
    }
}

fn check_level(name: &str, level: f64) -> Result<()> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(SurvivalError::invalid_parameter(name, level))
    }
}

fn check_breaks(name: &str, breaks: &[f64]) -> Result<()> {
    let sorted = breaks.windows(2).all(|w| w[0] < w[1]);
    if breaks.is_empty() || !sorted || breaks.iter().any(|b| !b.is_finite()) {
        return Err(SurvivalError::invalid_parameter(name, format!("{breaks:?}")));
    }
    Ok(())
}
