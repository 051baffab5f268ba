use itertools::Itertools;
use ndarray::{Array1, ScalarOperand};
use ndarray_linalg::{Lapack, Scalar};
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fit::{polyfit, Scaling};
use crate::measure::{quadrature, Measurement};
use crate::Result;

/// Calibration strategy, fixed when the curve is built.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Piecewise-linear lookup over the raw table; no uncertainty available.
    Interpolation,
    /// Exponential regression `gain = exp(A + B·x)` with propagated fit
    /// errors.
    Regression,
}

#[derive(Clone, Debug)]
enum Lookup<E> {
    Interpolation,
    Regression {
        intercept: Measurement<E>,
        slope: Measurement<E>,
    },
}

/// Gas gain as a function of the divider-current operating point, built once
/// from a calibration table and shared read-only by every sample.
#[derive(Clone, Debug)]
pub struct GainCurve<E: Scalar> {
    divider_current: Array1<E>,
    gain: Array1<E>,
    lookup: Lookup<E>,
}

impl<E> GainCurve<E>
where
    E: Float + Lapack + Scalar + ScalarOperand,
{
    /// Build a gain model from a `(divider current, gain)` table.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidCalibrationData`] if the table holds fewer
    /// than two points, a non-finite entry, a duplicate divider current, or
    /// (under [`Strategy::Regression`]) a gain that cannot be fitted in log
    /// space.
    pub fn build(table: &[(E, E)], strategy: Strategy) -> Result<Self> {
        if table.len() < 2 {
            return Err(Error::InvalidCalibrationData(format!(
                "{} calibration points, need at least 2",
                table.len()
            )));
        }
        if table
            .iter()
            .any(|&(x, g)| !Float::is_finite(x) || !Float::is_finite(g))
        {
            return Err(Error::InvalidCalibrationData(
                "non-finite calibration entry".into(),
            ));
        }

        let mut table: Vec<(E, E)> = table.to_vec();
        table.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite divider current"));
        if table.iter().tuple_windows().any(|(a, b)| a.0 == b.0) {
            return Err(Error::InvalidCalibrationData(
                "duplicate divider current".into(),
            ));
        }

        let lookup = match strategy {
            Strategy::Interpolation => Lookup::Interpolation,
            Strategy::Regression => {
                if table.iter().any(|&(_, g)| g <= E::zero()) {
                    return Err(Error::InvalidCalibrationData(
                        "non-positive gain cannot be fitted in log space".into(),
                    ));
                }
                let divider_current: Vec<E> = table.iter().map(|entry| entry.0).collect();
                let log_gain: Vec<E> = table.iter().map(|entry| Scalar::ln(entry.1)).collect();
                let fit = polyfit(&divider_current, &log_gain, 1, None, Scaling::Unscaled)?;
                Lookup::Regression {
                    intercept: fit.coefficient(0),
                    slope: fit.coefficient(1),
                }
            }
        };

        Ok(Self {
            divider_current: Array1::from_iter(table.iter().map(|entry| entry.0)),
            gain: Array1::from_iter(table.iter().map(|entry| entry.1)),
            lookup,
        })
    }
}

impl<E: Scalar + PartialOrd> GainCurve<E> {
    /// Gas gain at the given operating point.
    pub fn gain(&self, divider_current: E) -> E {
        match &self.lookup {
            Lookup::Interpolation => self.interpolate(divider_current),
            Lookup::Regression { intercept, slope } => {
                Scalar::exp(intercept.value + slope.value * divider_current)
            }
        }
    }

    /// One-sigma gain uncertainty at the operating point.
    ///
    /// An interpolated curve carries no uncertainty information and answers
    /// zero; a regressed curve propagates the fitted standard errors as
    /// `gain * sqrt(errA^2 + x^2 errB^2)`.
    pub fn error(&self, divider_current: E) -> E {
        match &self.lookup {
            Lookup::Interpolation => E::zero(),
            Lookup::Regression { intercept, slope } => {
                self.gain(divider_current)
                    * quadrature(&[
                        intercept.uncertainty,
                        divider_current * slope.uncertainty,
                    ])
            }
        }
    }

    pub fn measure(&self, divider_current: E) -> Measurement<E> {
        Measurement {
            value: self.gain(divider_current),
            uncertainty: self.error(divider_current),
        }
    }

    // Linear interpolation between the bracketing table nodes, extrapolating
    // along the end segments outside the table range.
    fn interpolate(&self, x: E) -> E {
        let nodes = &self.divider_current;
        let mut segment = nodes.len() - 2;
        for candidate in 0..nodes.len() - 1 {
            if x <= nodes[candidate + 1] {
                segment = candidate;
                break;
            }
        }
        let fraction = (x - nodes[segment]) / (nodes[segment + 1] - nodes[segment]);
        self.gain[segment] + fraction * (self.gain[segment + 1] - self.gain[segment])
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use proptest::strategy::Strategy as _;

    use crate::error::Error;

    use super::{GainCurve, Strategy};

    fn exponential_table(intercept: f64, slope: f64, points: &[f64]) -> Vec<(f64, f64)> {
        points
            .iter()
            .map(|&x| (x, (intercept + slope * x).exp()))
            .collect()
    }

    #[test]
    fn interpolation_passes_through_the_table_nodes() {
        let table = [(1.0, 10.0), (2.0, 20.0), (4.0, 40.0)];
        let curve = GainCurve::build(&table, Strategy::Interpolation).unwrap();

        for (x, g) in table {
            approx::assert_relative_eq!(curve.gain(x), g);
        }
    }

    #[test]
    fn interpolation_is_linear_between_nodes() {
        let table = [(1.0, 10.0), (2.0, 20.0), (4.0, 40.0)];
        let curve = GainCurve::build(&table, Strategy::Interpolation).unwrap();

        approx::assert_relative_eq!(curve.gain(1.5), 15.0);
        approx::assert_relative_eq!(curve.gain(3.0), 30.0);
    }

    #[test]
    fn interpolation_extrapolates_along_the_end_segments() {
        let table = [(1.0, 10.0), (2.0, 20.0), (4.0, 40.0)];
        let curve = GainCurve::build(&table, Strategy::Interpolation).unwrap();

        approx::assert_relative_eq!(curve.gain(0.0), 0.0);
        approx::assert_relative_eq!(curve.gain(5.0), 50.0);
        approx::assert_relative_eq!(curve.error(5.0), 0.0);
    }

    #[test]
    fn regression_recovers_an_exponential_table() {
        let table = exponential_table(8.9, 0.045, &[10.0, 15.0, 20.0, 25.0, 30.0, 40.0]);
        let curve = GainCurve::build(&table, Strategy::Regression).unwrap();

        for &(x, g) in &table {
            approx::assert_relative_eq!(curve.gain(x), g, max_relative = 1e-8);
            assert!(curve.error(x) < g * 1e-6);
        }
    }

    #[test]
    fn two_point_regression_is_exact_with_zero_errors() {
        let table = exponential_table(1.0, 0.1, &[10.0, 20.0]);
        let curve = GainCurve::build(&table, Strategy::Regression).unwrap();

        approx::assert_relative_eq!(curve.gain(10.0), table[0].1, max_relative = 1e-10);
        approx::assert_relative_eq!(curve.error(15.0), 0.0);
    }

    #[test]
    fn regression_error_grows_with_the_operating_point() {
        // Scatter the table so the fit carries genuine residuals.
        let mut table = exponential_table(8.9, 0.045, &[10.0, 15.0, 20.0, 25.0, 30.0, 40.0]);
        for (index, entry) in table.iter_mut().enumerate() {
            entry.1 *= if index % 2 == 0 { 1.02 } else { 0.98 };
        }
        let curve = GainCurve::build(&table, Strategy::Regression).unwrap();

        let relative = |x: f64| curve.error(x) / curve.gain(x);
        assert!(relative(50.0) < relative(100.0));
        assert!(relative(100.0) < relative(200.0));
    }

    #[test]
    fn sparse_tables_are_rejected() {
        let result = GainCurve::build(&[(1.0, 10.0)], Strategy::Interpolation);
        assert!(matches!(result, Err(Error::InvalidCalibrationData(_))));
    }

    #[test]
    fn non_finite_tables_are_rejected() {
        let result = GainCurve::build(&[(1.0, 10.0), (2.0, f64::NAN)], Strategy::Interpolation);
        assert!(matches!(result, Err(Error::InvalidCalibrationData(_))));
    }

    #[test]
    fn duplicate_divider_currents_are_rejected() {
        let result = GainCurve::build(
            &[(1.0, 10.0), (1.0, 12.0), (2.0, 20.0)],
            Strategy::Interpolation,
        );
        assert!(matches!(result, Err(Error::InvalidCalibrationData(_))));
    }

    #[test]
    fn non_positive_gains_cannot_be_regressed() {
        let result = GainCurve::build(&[(1.0, 10.0), (2.0, -3.0)], Strategy::Regression);
        assert!(matches!(result, Err(Error::InvalidCalibrationData(_))));
    }

    proptest! {
        #[test]
        fn interpolation_recovers_arbitrary_table_nodes(
            (nodes, gains) in prop::collection::btree_set(1u32..1000, 2..8)
                .prop_flat_map(|nodes| {
                    let len = nodes.len();
                    (
                        Just(nodes),
                        prop::collection::vec(1.0..1e5_f64, len),
                    )
                })
        ) {
            let table: Vec<(f64, f64)> = nodes
                .iter()
                .map(|&node| f64::from(node) / 10.0)
                .zip(gains)
                .collect();
            let curve = GainCurve::build(&table, Strategy::Interpolation).unwrap();

            for &(x, g) in &table {
                approx::assert_relative_eq!(curve.gain(x), g, max_relative = 1e-9);
            }
        }
    }
}
