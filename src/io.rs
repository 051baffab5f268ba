use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use ndarray::ScalarOperand;
use ndarray_linalg::{Lapack, Scalar};
use num_traits::Float;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::gain::{GainCurve, Strategy};
use crate::group::MeasurementGroup;
use crate::sample::{Constants, RawSeries};
use crate::saturation::Method;
use crate::Result;

/// Analysis settings shared by every sample in a measurement directory,
/// read from its `analysis.toml`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AnalysisConfig<E> {
    /// Name of the linearization method, e.g. `"saturating"`.
    pub method: String,
    /// Divider current at which the detector was operated.
    pub divider_current: E,
    /// How the gain table is turned into a curve.
    pub strategy: Strategy,
    /// Collimator radius; the fallback spot area applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collimator_radius: Option<E>,
    /// Pin the piecewise breakpoint here instead of fitting it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<f64>,
    /// Physical constants override; the source defaults apply when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constants: Option<Constants<E>>,
}

impl<E> AnalysisConfig<E> {
    /// Resolve the configured method name, attaching the pinned breakpoint
    /// where one applies.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedLinearizationMethod`](crate::Error::UnsupportedLinearizationMethod)
    /// for an unrecognized name.
    pub fn linearization(&self) -> Result<Method> {
        let method = self.method.parse::<Method>()?;
        if let (Method::PiecewiseContinuous { .. }, Some(breakpoint)) = (method, self.breakpoint) {
            return Ok(Method::PiecewiseContinuous {
                breakpoint: Some(breakpoint),
            });
        }
        Ok(method)
    }
}

#[derive(Deserialize)]
struct GainRow<E>(E, E);

#[derive(Deserialize)]
struct SeriesRow<E>(E, E, E, E);

/// Read a gain calibration table of `(divider current, gain)` rows.
///
/// # Errors
/// Returns an error if the file cannot be read or a row fails to parse.
pub fn read_gain_table<E: DeserializeOwned>(path: &Path) -> Result<Vec<(E, E)>> {
    let file = fs::read(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(&file[..]);

    let mut table = vec![];
    for result in rdr.deserialize() {
        let record: GainRow<E> = result?;
        table.push((record.0, record.1));
    }
    Ok(table)
}

/// Read one raw dataset of `(stimulus, stimulus error, current, current
/// error)` rows.
///
/// # Errors
/// Returns an error if the file cannot be read or a row fails to parse.
pub fn read_raw_series<E: DeserializeOwned>(path: &Path) -> Result<RawSeries<E>> {
    let file = fs::read(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(&file[..]);

    let mut series = RawSeries::default();
    for result in rdr.deserialize() {
        let record: SeriesRow<E> = result?;
        series.push(record.0, record.1, record.2, record.3);
    }
    Ok(series)
}

/// Build a measurement group from a directory holding `analysis.toml`, a
/// `gain.csv` calibration table and a `samples` directory of per-dataset
/// csv files.
///
/// Samples join the group in lexical order of their file names.
///
/// # Errors
/// Returns an error if the directory layout is incomplete, a file fails to
/// parse, or the calibration table is rejected.
pub fn build<E>(working_directory: &Path) -> Result<MeasurementGroup<E>>
where
    E: DeserializeOwned
        + Float
        + Lapack
        + Scalar
        + ScalarOperand
        + PartialOrd
        + Into<f64>
        + From<f64>,
{
    let config = fs::read_to_string(working_directory.join("analysis.toml"))?;
    let config: AnalysisConfig<E> = toml::from_str(&config)?;
    let method = config.linearization()?;

    let table = read_gain_table::<E>(&working_directory.join("gain.csv"))?;
    let calibration = GainCurve::build(&table, config.strategy)?;

    let mut paths = vec![];
    for entry in fs::read_dir(working_directory.join("samples"))? {
        let path = entry?.path();
        if path.extension().map_or(false, |extension| extension == "csv") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut series = vec![];
    for path in paths {
        log::info!("reading sample data from {path:?}");
        let name = path
            .file_stem()
            .and_then(OsStr::to_str)
            .map_or_else(|| path.to_string_lossy().into_owned(), ToOwned::to_owned);
        series.push((name, read_raw_series::<E>(&path)?));
    }

    let mut group = MeasurementGroup::from_grouped_input(
        series,
        calibration,
        config.divider_current,
        method,
        config.constants.unwrap_or_default(),
    )?;
    group.set_collimator_radius(config.collimator_radius);
    Ok(group)
}
