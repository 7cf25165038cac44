use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::{
    design::{self, DesignMatrix, Term},
    error::{Result, SurvivalError},
    table::Table,
};

/// survival data ready for model fitting - times, events, numeric covariates, strata
#[derive(Debug, Clone)]
pub struct SurvivalData {
    times: Array1<f64>,          // time to event/censoring
    events: Vec<bool>,           // true = event, false = censored
    covariates: Array2<f64>,     // n_samples x n_features
    strata: Vec<usize>,          // stratum code per subject, all 0 when unstratified
    stratum_labels: Vec<String>,
    terms: Vec<Term>,
    order: Vec<Vec<usize>>,      // per stratum, subjects sorted by descending time
}

impl SurvivalData {
    /// make new unstratified survival data from raw vecs/arrays
    pub fn new(times: Vec<f64>, events: Vec<bool>, covariates: Array2<f64>) -> Result<Self> {
        let n_samples = times.len();

        if events.len() != n_samples {
            return Err(SurvivalError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                n_samples,
                events.len()
            )));
        }

        if covariates.nrows() != n_samples {
            return Err(SurvivalError::invalid_dimensions(format!(
                "covariates rows ({}) != n_samples ({})",
                covariates.nrows(),
                n_samples
            )));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(SurvivalError::invalid_survival_data(
                "survival times must be non-negative & finite",
            ));
        }

        if covariates.iter().any(|x| !x.is_finite()) {
            return Err(SurvivalError::invalid_survival_data("covariates must be finite"));
        }

        let terms = (0..covariates.ncols())
            .map(|j| Term { name: format!("x{j}"), column: format!("x{j}"), level: None })
            .collect();

        let mut data = Self {
            times: Array1::from(times),
            events,
            covariates,
            strata: vec![0; n_samples],
            stratum_labels: vec!["all".to_string()],
            terms,
            order: Vec::new(),
        };
        data.compute_order();
        Ok(data)
    }

    /// Build from a table: reference-coded covariates plus optional strata column.
    pub fn from_table<S: AsRef<str>>(table: &Table, covariates: &[S], strata: Option<&str>) -> Result<Self> {
        let design = DesignMatrix::build(table, covariates)?;
        let data = Self::new(table.times().to_vec(), table.events().to_vec(), design.matrix)?
            .with_terms(design.terms)?;

        match strata {
            Some(name) => {
                let (codes, labels) = design::strata_codes(table, name)?;
                data.with_strata(codes, labels)
            }
            None => Ok(data),
        }
    }

    /// attach strata - each code indexes `labels`
    pub fn with_strata(mut self, strata: Vec<usize>, labels: Vec<String>) -> Result<Self> {
        if strata.len() != self.n_samples() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "strata len ({}) != n_samples ({})",
                strata.len(),
                self.n_samples()
            )));
        }
        if strata.iter().any(|&s| s >= labels.len()) {
            return Err(SurvivalError::invalid_dimensions("stratum code without a label"));
        }
        self.strata = strata;
        self.stratum_labels = labels;
        self.compute_order();
        Ok(self)
    }

    /// label the covariate columns
    pub fn with_terms(mut self, terms: Vec<Term>) -> Result<Self> {
        if terms.len() != self.n_features() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "{} term names for {} features",
                terms.len(),
                self.n_features()
            )));
        }
        self.terms = terms;
        Ok(self)
    }

    /// group subjects by stratum, latest time first, so risk sets grow as we walk
    fn compute_order(&mut self) {
        let mut order = vec![Vec::new(); self.stratum_labels.len()];
        for (i, &s) in self.strata.iter().enumerate() {
            order[s].push(i);
        }
        for idx in &mut order {
            idx.sort_by(|&a, &b| self.times[b].total_cmp(&self.times[a]));
        }
        self.order = order;
    }

    /// how many patients
    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    /// how many model columns per patient
    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    pub fn n_strata(&self) -> usize {
        self.stratum_labels.len()
    }

    /// survival/censoring times
    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// event indicators (true = event, false = censored)
    pub fn events(&self) -> &[bool] {
        &self.events
    }

    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    pub fn strata(&self) -> &[usize] {
        &self.strata
    }

    pub fn stratum_labels(&self) -> &[String] {
        &self.stratum_labels
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn term_names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.clone()).collect()
    }

    /// subject indices of one stratum, descending time
    pub(crate) fn stratum_order(&self, stratum: usize) -> &[usize] {
        &self.order[stratum]
    }

    /// unique event times in order (all strata pooled)
    pub fn event_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self
            .times
            .iter()
            .zip(self.events.iter())
            .filter_map(|(time, event)| if *event { Some(*time) } else { None })
            .collect();

        times.sort_by(f64::total_cmp);
        times.dedup();
        times
    }

    /// covariates centred on their column means (partial likelihood is shift invariant)
    pub(crate) fn centred_covariates(&self) -> Array2<f64> {
        match self.covariates.mean_axis(Axis(0)) {
            Some(means) => &self.covariates - &means,
            None => self.covariates.clone(),
        }
    }

    /// grab a subset of patients by indices
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if indices.iter().any(|&i| i >= self.n_samples()) {
            return Err(SurvivalError::invalid_dimensions("subset index out of bounds"));
        }

        let times: Vec<f64> = indices.iter().map(|&i| self.times[i]).collect();
        let events: Vec<bool> = indices.iter().map(|&i| self.events[i]).collect();
        let covariates = self.covariates.select(Axis(0), indices);
        let strata = indices.iter().map(|&i| self.strata[i]).collect();

        Self::new(times, events, covariates)?
            .with_terms(self.terms.clone())?
            .with_strata(strata, self.stratum_labels.clone())
    }
}
