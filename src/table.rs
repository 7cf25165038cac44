use serde::Serialize;

use crate::error::{Result, SurvivalError};

/// categorical column: level labels + per-row level index (None = missing)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Factor {
    levels: Vec<String>,
    codes: Vec<Option<usize>>,
    reference: usize, // level absorbed into the baseline hazard
}

impl Factor {
    /// build from level labels and codes, first level is the reference
    pub fn new(levels: Vec<String>, codes: Vec<Option<usize>>) -> Result<Self> {
        if levels.is_empty() {
            return Err(SurvivalError::invalid_parameter("levels", "[]"));
        }
        if let Some(bad) = codes.iter().flatten().find(|&&c| c >= levels.len()) {
            return Err(SurvivalError::invalid_dimensions(format!(
                "level code {bad} out of range for {} levels",
                levels.len()
            )));
        }
        Ok(Self { levels, codes, reference: 0 })
    }

    /// build from labels; a label not in `levels` is a data error
    pub fn from_labels<S: AsRef<str>>(levels: &[&str], values: &[Option<S>]) -> Result<Self> {
        let codes = values
            .iter()
            .enumerate()
            .map(|(row, value)| match value {
                None => Ok(None),
                Some(label) => levels
                    .iter()
                    .position(|l| *l == label.as_ref())
                    .map(Some)
                    .ok_or_else(|| {
                        SurvivalError::invalid_survival_data(format!(
                            "row {row}: unknown level '{}'",
                            label.as_ref()
                        ))
                    }),
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(levels.iter().map(|l| l.to_string()).collect(), codes)
    }

    /// pick a different reference level by label
    pub fn with_reference(mut self, level: &str) -> Result<Self> {
        self.reference = self
            .levels
            .iter()
            .position(|l| l == level)
            .ok_or_else(|| SurvivalError::invalid_parameter("reference", level))?;
        Ok(self)
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[Option<usize>] {
        &self.codes
    }

    pub fn reference(&self) -> usize {
        self.reference
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn label(&self, row: usize) -> Option<&str> {
        self.codes[row].map(|c| self.levels[c].as_str())
    }

    /// subjects per level, missing rows excluded
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.levels.len()];
        for code in self.codes.iter().flatten() {
            counts[*code] += 1;
        }
        counts
    }

    pub(crate) fn set_code(&mut self, row: usize, code: usize) {
        self.codes[row] = Some(code);
    }

    fn subset(&self, rows: &[usize]) -> Self {
        Self {
            levels: self.levels.clone(),
            codes: rows.iter().map(|&r| self.codes[r]).collect(),
            reference: self.reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Column {
    Categorical(Factor),
    Continuous(Vec<Option<f64>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Categorical(f) => f.len(),
            Column::Continuous(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Column::Categorical(f) => f.codes[row].is_none(),
            Column::Continuous(v) => v[row].is_none(),
        }
    }

    pub fn missing_count(&self) -> usize {
        (0..self.len()).filter(|&r| self.is_missing(r)).count()
    }

    fn subset(&self, rows: &[usize]) -> Self {
        match self {
            Column::Categorical(f) => Column::Categorical(f.subset(rows)),
            Column::Continuous(v) => Column::Continuous(rows.iter().map(|&r| v[r]).collect()),
        }
    }
}

/// subjects x (outcome + named covariates)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    times: Vec<f64>,            // follow-up, months
    events: Vec<bool>,          // true = died, false = censored
    columns: Vec<(String, Column)>,
}

impl Table {
    pub fn new(times: Vec<f64>, events: Vec<bool>) -> Result<Self> {
        if times.len() != events.len() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                times.len(),
                events.len()
            )));
        }
        if let Some(row) = times.iter().position(|t| !t.is_finite() || *t < 0.0) {
            return Err(SurvivalError::invalid_survival_data(format!(
                "row {row}: follow-up time must be finite and >= 0, got {}",
                times[row]
            )));
        }
        Ok(Self { times, events, columns: Vec::new() })
    }

    /// append a named column (builder style)
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self> {
        self.push_column(name, column)?;
        Ok(self)
    }

    pub fn push_column(&mut self, name: impl Into<String>, column: Column) -> Result<()> {
        let name = name.into();
        if column.len() != self.n_rows() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "column '{name}' has {} rows, table has {}",
                column.len(),
                self.n_rows()
            )));
        }
        if self.columns.iter().any(|(n, _)| *n == name) {
            return Err(SurvivalError::invalid_parameter("column", format!("duplicate '{name}'")));
        }
        self.columns.push((name, column));
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.times.len()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn events(&self) -> &[bool] {
        &self.events
    }

    pub fn columns(&self) -> &[(String, Column)] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| SurvivalError::UnknownColumn(name.to_string()))
    }

    pub(crate) fn column_mut(&mut self, name: &str) -> Result<&mut Column> {
        self.columns
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| SurvivalError::UnknownColumn(name.to_string()))
    }

    pub fn factor(&self, name: &str) -> Result<&Factor> {
        match self.column(name)? {
            Column::Categorical(f) => Ok(f),
            Column::Continuous(_) => Err(SurvivalError::ColumnType {
                column: name.to_string(),
                expected: "categorical",
            }),
        }
    }

    pub fn continuous(&self, name: &str) -> Result<&[Option<f64>]> {
        match self.column(name)? {
            Column::Continuous(v) => Ok(v),
            Column::Categorical(_) => Err(SurvivalError::ColumnType {
                column: name.to_string(),
                expected: "continuous",
            }),
        }
    }

    /// rows where every named column is observed (complete-case selection)
    pub fn complete_rows<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        let columns = names
            .iter()
            .map(|n| self.column(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok((0..self.n_rows())
            .filter(|&row| columns.iter().all(|c| !c.is_missing(row)))
            .collect())
    }

    /// names of columns with at least one missing entry, in table order
    pub fn incomplete_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, c)| c.missing_count() > 0)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete_columns().is_empty()
    }

    /// same rows, only the named columns (in the order given)
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if columns.iter().any(|(n, _): &(String, Column)| n == name) {
                continue;
            }
            columns.push((name.to_string(), self.column(name)?.clone()));
        }
        Ok(Self { times: self.times.clone(), events: self.events.clone(), columns })
    }

    pub fn subset(&self, rows: &[usize]) -> Result<Self> {
        if rows.iter().any(|&r| r >= self.n_rows()) {
            return Err(SurvivalError::invalid_dimensions("subset index out of bounds"));
        }
        Ok(Self {
            times: rows.iter().map(|&r| self.times[r]).collect(),
            events: rows.iter().map(|&r| self.events[r]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.subset(rows)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        let exposure = Factor::from_labels(
            &["never", "light", "heavy"],
            &[Some("never"), Some("heavy"), None, Some("light")],
        )
        .unwrap();
        Table::new(vec![1.0, 2.0, 3.0, 4.0], vec![true, false, true, false])
            .unwrap()
            .with_column("exposure", Column::Categorical(exposure))
            .unwrap()
            .with_column("age", Column::Continuous(vec![Some(50.0), None, Some(61.0), Some(70.0)]))
            .unwrap()
    }

    #[test]
    fn test_complete_rows() {
        let t = table();
        assert_eq!(t.complete_rows(&["exposure"]).unwrap(), vec![0, 1, 3]);
        assert_eq!(t.complete_rows(&["exposure", "age"]).unwrap(), vec![0, 3]);
        assert_eq!(t.incomplete_columns(), vec!["exposure", "age"]);
        assert!(!t.is_complete());
    }

    #[test]
    fn test_unknown_label_is_error() {
        let res = Factor::from_labels(&["a", "b"], &[Some("c")]);
        assert!(res.is_err());
    }

    #[test]
    fn test_factor_counts_and_reference() {
        let t = table();
        let f = t.factor("exposure").unwrap().clone().with_reference("heavy").unwrap();
        assert_eq!(f.counts(), vec![1, 1, 1]);
        assert_eq!(f.reference(), 2);
        assert_eq!(f.label(1), Some("heavy"));
        assert_eq!(f.label(2), None);
    }

    #[test]
    fn test_negative_time_rejected() {
        assert!(Table::new(vec![-1.0], vec![true]).is_err());
        assert!(Table::new(vec![0.0], vec![true]).is_ok());
    }

    #[test]
    fn test_column_type_errors() {
        let t = table();
        assert!(t.factor("age").is_err());
        assert!(t.continuous("exposure").is_err());
        assert!(matches!(t.column("bmi"), Err(SurvivalError::UnknownColumn(_))));
    }

    #[test]
    fn test_select() {
        let t = table().select(&["age", "age"]).unwrap();
        assert_eq!(t.columns().len(), 1);
        assert!(t.column("exposure").is_err());
        assert!(table().select(&["bmi"]).is_err());
    }

    #[test]
    fn test_subset() {
        let t = table().subset(&[3, 0]).unwrap();
        assert_eq!(t.times(), &[4.0, 1.0]);
        assert_eq!(t.factor("exposure").unwrap().label(0), Some("light"));
    }
}
