use thiserror::Error;

pub type Result<T> = std::result::Result<T, SurvivalError>;

#[derive(Error, Debug)]
pub enum SurvivalError {
    #[error("dimensions don't match: {message}")]
    InvalidDimensions { message: String },

    #[error("survival data is broken: {message}")]
    InvalidSurvivalData { message: String },

    #[error("row {row}: missing value in required column '{column}'")]
    MissingValue { column: String, row: usize },

    #[error("no column named '{0}'")]
    UnknownColumn(String),

    #[error("column '{column}' is not {expected}")]
    ColumnType { column: String, expected: &'static str },

    #[error("newton-raphson did not converge after {iterations} iterations (max |step| = {last_step:.3e})")]
    ConvergenceFailure { iterations: usize, last_step: f64 },

    #[error("design matrix is rank deficient: rank {rank} < {columns} columns")]
    RankDeficient { rank: usize, columns: usize },

    #[error("covariate '{term}' is constant within every stratum - no information to estimate it")]
    ConstantCovariate { term: String },

    #[error("matrix is singular: {message}")]
    SingularMatrix { message: String },

    #[error("numerical issues: {message}")]
    NumericalError { message: String },

    #[error("median survival undefined for '{stratum}': curve never reaches 0.5")]
    UndefinedMedian { stratum: String },

    #[error("need at least 2 imputations to pool, got {m}")]
    InsufficientImputations { m: usize },

    #[error("imputation {index} failed: {source}")]
    ImputationFailed {
        index: usize,
        #[source]
        source: Box<SurvivalError>,
    },

    #[error("bad parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

impl SurvivalError {
    pub fn invalid_dimensions(message: impl Into<String>) -> Self {
        Self::InvalidDimensions { message: message.into() }
    }

    pub fn invalid_survival_data(message: impl Into<String>) -> Self {
        Self::InvalidSurvivalData { message: message.into() }
    }

    pub fn missing_value(column: impl Into<String>, row: usize) -> Self {
        Self::MissingValue { column: column.into(), row }
    }

    pub fn singular(message: impl Into<String>) -> Self {
        Self::SingularMatrix { message: message.into() }
    }

    pub fn numerical_error(message: impl Into<String>) -> Self {
        Self::NumericalError { message: message.into() }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, value: impl ToString) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.to_string(),
        }
    }

    /// wrap a per-imputation failure so callers know which chain broke
    pub fn imputation_failed(index: usize, source: SurvivalError) -> Self {
        Self::ImputationFailed { index, source: Box::new(source) }
    }
}
