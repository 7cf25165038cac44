//! # hnc survival
//!
//! survival analysis core for a head & neck cancer cohort - recoding, kaplan-meier,
//! cox regression, PH diagnostics, multiple imputation
//!
//! ## what you get
//!
//! - typed cohort table with explicit missingness + recoding of raw patient records
//! - kaplan-meier curves w/ greenwood bands, medians, k-sample log-rank
//! - cox PH via newton-raphson, efron or breslow ties, stratified fits
//! - schoenfeld residual tests + cloglog curves for the PH assumption
//! - chained-equation imputation pooled by rubin's rules
//!
//! ## quick start
//!
//! ```rust
//! use hnc_survival::{CoxModel, SurvivalData};
//! use ndarray::Array2;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let times = vec![1.0, 2.5, 3.2, 4.1, 5.0, 6.3];
//! let events = vec![true, false, true, true, false, true]; // true = died, false = censored
//! let covariates = Array2::from_shape_vec((6, 1), vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0])?;
//! let data = SurvivalData::new(times, events, covariates)?;
//!
//! let fit = CoxModel::new().fit(&data)?;
//! println!("{}", fit.table());
//! let hazard_ratios = fit.hazard_ratios();
//! # assert_eq!(hazard_ratios.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod design;
pub mod diagnostics;
pub mod error;
pub mod imputation;
pub mod kaplan_meier;
pub mod linalg;
pub mod logrank;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod pipeline;
pub mod pooling;
pub mod prepare;
pub mod table;

pub use config::AnalysisConfig;
pub use data::SurvivalData;
pub use error::{Result, SurvivalError};
pub use kaplan_meier::{KaplanMeier, SurvivalCurve};
pub use model::{CoxFit, CoxModel};
pub use optimization::TieMethod;
pub use pipeline::{CompleteCaseAnalysis, CoxSpec, MultipleImputationAnalysis};
pub use prepare::{RawPatient, prepare};
pub use table::{Column, Factor, Table};
