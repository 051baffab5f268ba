use thiserror::Error;

/// Failure modes of the rate-capability pipeline.
///
/// Construction-time errors (`InvalidCalibrationData`, `InvalidSampleData`,
/// `UnsupportedLinearizationMethod`) abort before any fit runs. Fit and
/// derived-quantity errors are reported per sample and per quantity.
#[derive(Debug, Error)]
pub enum Error {
    /// The gain calibration table cannot support the requested strategy.
    #[error("invalid calibration data: {0}")]
    InvalidCalibrationData(String),

    /// A raw sample violates the construction invariants.
    #[error("invalid sample data: {0}")]
    InvalidSampleData(String),

    /// The configured linearization method name is not recognised.
    #[error("unsupported linearization method `{0}`")]
    UnsupportedLinearizationMethod(String),

    /// A least-squares fit was underdetermined, singular or ran out of
    /// iterations without converging.
    #[error("fit did not converge: {0}")]
    FitDidNotConverge(String),

    /// A derived quantity would divide by zero.
    #[error("division by zero computing {0}")]
    DivisionByZero(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

// The solver's error type is dynamic and cannot go through `#[from]`.
impl From<argmin::core::Error> for Error {
    fn from(error: argmin::core::Error) -> Self {
        Self::FitDidNotConverge(error.to_string())
    }
}
