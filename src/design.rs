use log::warn;
use ndarray::{Array2, ArrayView2, Axis};
use serde::Serialize;

use crate::{
    error::{Result, SurvivalError},
    linalg,
    table::{Column, Table},
};

pub(crate) const RANK_TOL: f64 = 1e-10;

/// one model column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Term {
    pub name: String,          // e.g. "smoking[>=10 PY]"
    pub column: String,        // source table column
    pub level: Option<String>, // None for continuous covariates
}

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub matrix: Array2<f64>, // n_rows x n_terms
    pub terms: Vec<Term>,
}

impl DesignMatrix {
    /// one indicator per observed non-reference level; missing values are an error
    pub fn build<S: AsRef<str>>(table: &Table, covariates: &[S]) -> Result<Self> {
        let n = table.n_rows();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut terms = Vec::new();

        for name in covariates {
            let name = name.as_ref();
            let column = table.column(name)?;
            if let Some(row) = (0..n).find(|&r| column.is_missing(r)) {
                return Err(SurvivalError::missing_value(name, row));
            }

            match column {
                Column::Continuous(values) => {
                    columns.push(values.iter().map(|v| v.unwrap_or(f64::NAN)).collect());
                    terms.push(Term { name: name.to_string(), column: name.to_string(), level: None });
                }
                Column::Categorical(factor) => {
                    let counts = factor.counts();
                    let mut reference = factor.reference();
                    if counts[reference] == 0 {
                        reference = counts.iter().position(|&c| c > 0).unwrap_or(reference);
                        warn!(
                            "reference level '{}' of '{name}' has no subjects, using '{}'",
                            factor.levels()[factor.reference()],
                            factor.levels()[reference]
                        );
                    }

                    for (level, label) in factor.levels().iter().enumerate() {
                        if level == reference || counts[level] == 0 {
                            continue;
                        }
                        columns.push(
                            factor
                                .codes()
                                .iter()
                                .map(|c| if *c == Some(level) { 1.0 } else { 0.0 })
                                .collect(),
                        );
                        terms.push(Term {
                            name: format!("{name}[{label}]"),
                            column: name.to_string(),
                            level: Some(label.clone()),
                        });
                    }
                }
            }
        }

        let mut matrix = Array2::zeros((n, columns.len()));
        for (j, values) in columns.into_iter().enumerate() {
            for (i, v) in values.into_iter().enumerate() {
                matrix[[i, j]] = v;
            }
        }

        Ok(Self { matrix, terms })
    }

    pub fn term_names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.clone()).collect()
    }
}

/// Strata codes for a categorical column; missing strata are an error.
pub fn strata_codes(table: &Table, name: &str) -> Result<(Vec<usize>, Vec<String>)> {
    let factor = table.factor(name)?;
    let codes = factor
        .codes()
        .iter()
        .enumerate()
        .map(|(row, c)| c.ok_or_else(|| SurvivalError::missing_value(name, row)))
        .collect::<Result<Vec<_>>>()?;
    Ok((codes, factor.levels().to_vec()))
}

/// one stratum per combination that occurs, labelled `site=oral, grade=G2`
pub fn combined_strata<S: AsRef<str>>(table: &Table, names: &[S]) -> Result<(Vec<usize>, Vec<String>)> {
    match names {
        [] => Ok((vec![0; table.n_rows()], vec!["all".to_string()])),
        [single] => strata_codes(table, single.as_ref()),
        _ => {
            let parts = names
                .iter()
                .map(|n| Ok((n.as_ref(), strata_codes(table, n.as_ref())?)))
                .collect::<Result<Vec<_>>>()?;

            let keys: Vec<Vec<usize>> = (0..table.n_rows())
                .map(|row| parts.iter().map(|(_, (codes, _))| codes[row]).collect())
                .collect();
            let mut distinct = keys.clone();
            distinct.sort();
            distinct.dedup();

            let labels = distinct
                .iter()
                .map(|key| {
                    key.iter()
                        .zip(&parts)
                        .map(|(&code, (name, (_, levels)))| format!("{name}={}", levels[code]))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .collect();
            let codes = keys
                .iter()
                .map(|key| distinct.binary_search(key).unwrap_or(0))
                .collect();
            Ok((codes, labels))
        }
    }
}

/// result of the rank / conditioning screen
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Collinearity {
    pub rank: usize,
    pub condition_number: f64,
}

/// rank and condition number of X'X after centring and unit-length scaling
pub fn collinearity(x: ArrayView2<f64>) -> Result<Collinearity> {
    let p = x.ncols();
    if p == 0 {
        return Ok(Collinearity { rank: 0, condition_number: 1.0 });
    }

    let means = x
        .mean_axis(Axis(0))
        .ok_or_else(|| SurvivalError::invalid_dimensions("design matrix has no rows"))?;
    let mut z = &x - &means;
    for mut col in z.columns_mut() {
        let norm = col.dot(&col).sqrt();
        if norm > 0.0 {
            col /= norm;
        }
    }

    let eigen = linalg::symmetric_eigenvalues(z.t().dot(&z).view())?;
    let max = eigen.last().copied().unwrap_or(0.0);
    let rank = eigen.iter().filter(|&&l| l > RANK_TOL * max.max(f64::MIN_POSITIVE)).count();
    let condition_number = if rank == p && max > 0.0 {
        (max / eigen[0]).sqrt()
    } else {
        f64::INFINITY
    };

    Ok(Collinearity { rank, condition_number })
}
