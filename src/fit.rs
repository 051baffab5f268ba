use ndarray::{Array1, Axis, ScalarOperand};
use ndarray_linalg::{Inverse, Lapack, Scalar, Solve};
use num_traits::Float;

use crate::error::Error;
use crate::math::vandermonde;
use crate::measure::Measurement;
use crate::Result;

/// Conditioning applied to the abscissa before the normal equations are formed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Scaling {
    /// Fit the raw abscissa.
    #[default]
    Unscaled,
    /// Divide the abscissa by its largest magnitude before fitting, folding
    /// the scale back into the reported coefficients.
    MaxAbs,
}

/// A fitted polynomial: coefficients in ascending power order, each carrying
/// the standard error extracted from the least-squares covariance, plus the
/// abscissa window the fitted data covered.
#[derive(Clone, Debug)]
pub struct FitResult<E> {
    coefficients: Vec<Measurement<E>>,
    window: (E, E),
}

impl<E: Scalar> FitResult<E> {
    /// The coefficient of `x^power`.
    ///
    /// # Panics
    ///
    /// Panics if `power` exceeds the fitted degree.
    pub fn coefficient(&self, power: usize) -> Measurement<E> {
        self.coefficients[power]
    }

    pub const fn window(&self) -> (E, E) {
        self.window
    }
}

/// Weighted least-squares polynomial fit of `y` on `x`.
///
/// `weights`, when given, are inverse-variance weights; the coefficient
/// covariance is then taken directly from the weighted normal equations. An
/// unweighted fit instead scales the covariance by the residual variance
/// `SSR / dof`, so that data which determine the polynomial exactly
/// (`dof == 0`) report zero standard errors.
///
/// # Errors
///
/// Fails with [`Error::FitDidNotConverge`] when fewer points than
/// coefficients are supplied or the normal equations are singular.
///
/// # Panics
///
/// Panics if `x`, `y` and `weights` differ in length.
///
/// # Examples
///
/// ```
/// use rate_capability::fit::{polyfit, Scaling};
///
/// let x = [0.0_f64, 1.0, 2.0, 3.0];
/// let y: Vec<f64> = x.iter().map(|x| 0.5 + 2.0 * x).collect();
/// let fit = polyfit(&x, &y, 1, None, Scaling::Unscaled).unwrap();
///
/// approx::assert_relative_eq!(fit.coefficient(0).value, 0.5, max_relative = 1e-10);
/// approx::assert_relative_eq!(fit.coefficient(1).value, 2.0, max_relative = 1e-10);
/// ```
pub fn polyfit<E>(
    x: &[E],
    y: &[E],
    degree: usize,
    weights: Option<&[E]>,
    scaling: Scaling,
) -> Result<FitResult<E>>
where
    E: Float + Lapack + Scalar + ScalarOperand,
{
    assert_eq!(x.len(), y.len());
    if let Some(weights) = weights {
        assert_eq!(x.len(), weights.len());
    }

    let points = x.len();
    let parameters = degree + 1;
    if points < parameters {
        return Err(Error::FitDidNotConverge(format!(
            "{points} points cannot constrain {parameters} polynomial coefficients"
        )));
    }

    let scale = match scaling {
        Scaling::Unscaled => E::one(),
        Scaling::MaxAbs => {
            let largest = x
                .iter()
                .fold(E::zero(), |acc, &v| Float::max(acc, Float::abs(v)));
            if largest == E::zero() {
                E::one()
            } else {
                largest
            }
        }
    };

    let scaled: Vec<E> = x.iter().map(|&v| v / scale).collect();
    let design = vandermonde(&scaled, degree);
    let observations = Array1::from_iter(y.iter().copied());

    let (normal, moment) = match weights {
        Some(weights) => {
            let weights = Array1::from_iter(weights.iter().copied());
            let weighted = &design * &weights.insert_axis(Axis(1));
            (weighted.t().dot(&design), weighted.t().dot(&observations))
        }
        None => (design.t().dot(&design), design.t().dot(&observations)),
    };

    let solution = normal.solve(&moment).map_err(|error| {
        Error::FitDidNotConverge(format!("normal equations are singular: {error}"))
    })?;
    let covariance = normal
        .inv()
        .map_err(|error| Error::FitDidNotConverge(format!("covariance is singular: {error}")))?;

    let residual_variance = if weights.is_some() {
        E::one()
    } else {
        let dof = points - parameters;
        if dof == 0 {
            E::zero()
        } else {
            let residuals = &observations - &design.dot(&solution);
            residuals.dot(&residuals) / E::from_usize(dof).expect("dof fits in E")
        }
    };

    let window = x.iter().fold((x[0], x[0]), |(lo, hi), &v| {
        (Float::min(lo, v), Float::max(hi, v))
    });

    let coefficients = solution
        .iter()
        .enumerate()
        .map(|(power, &value)| {
            let unscale = Scalar::powi(scale, i32::try_from(power).expect("power fits in `i32`"));
            let variance = covariance[[power, power]] * residual_variance;
            let uncertainty = if variance > E::zero() {
                Scalar::sqrt(variance)
            } else {
                E::zero()
            };
            Measurement {
                value: value / unscale,
                uncertainty: uncertainty / unscale,
            }
        })
        .collect();

    Ok(FitResult {
        coefficients,
        window,
    })
}

#[cfg(test)]
mod tests {
    use crate::error::Error;

    use super::{polyfit, Scaling};

    // Fixed measurements scattered about y = 1 + 2x.
    const X: [f64; 5] = [0.0, 1.0, 2.0, 3.0, 4.0];
    const Y: [f64; 5] = [1.1, 2.9, 5.2, 6.8, 9.1];

    fn simple_regression_errors(x: &[f64], y: &[f64]) -> (f64, f64) {
        let n = x.len() as f64;
        let x_mean = x.iter().sum::<f64>() / n;
        let y_mean = y.iter().sum::<f64>() / n;
        let sxx: f64 = x.iter().map(|x| (x - x_mean).powi(2)).sum();
        let sxy: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| (x - x_mean) * (y - y_mean))
            .sum();
        let slope = sxy / sxx;
        let intercept = y_mean - slope * x_mean;

        let ssr: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| (y - intercept - slope * x).powi(2))
            .sum();
        let residual_variance = ssr / (n - 2.0);

        let intercept_error = (residual_variance * (1.0 / n + x_mean.powi(2) / sxx)).sqrt();
        let slope_error = (residual_variance / sxx).sqrt();
        (intercept_error, slope_error)
    }

    #[test]
    fn line_fit_standard_errors_match_the_closed_form() {
        let fit = polyfit(&X, &Y, 1, None, Scaling::Unscaled).unwrap();
        let (intercept_error, slope_error) = simple_regression_errors(&X, &Y);

        approx::assert_relative_eq!(
            fit.coefficient(0).uncertainty,
            intercept_error,
            max_relative = 1e-10
        );
        approx::assert_relative_eq!(
            fit.coefficient(1).uncertainty,
            slope_error,
            max_relative = 1e-10
        );
    }

    #[test]
    fn uniform_inverse_variance_weights_reproduce_the_absolute_sigma_errors() {
        let sigma = 0.15_f64;
        let weights = [1.0 / sigma.powi(2); 5];
        let fit = polyfit(&X, &Y, 1, Some(&weights), Scaling::Unscaled).unwrap();

        let n = X.len() as f64;
        let x_mean = X.iter().sum::<f64>() / n;
        let sxx: f64 = X.iter().map(|x| (x - x_mean).powi(2)).sum();

        approx::assert_relative_eq!(
            fit.coefficient(1).uncertainty,
            sigma / sxx.sqrt(),
            max_relative = 1e-10
        );
    }

    #[test]
    fn abscissa_scaling_leaves_the_coefficients_unchanged() {
        let x: Vec<f64> = (0..8).map(|n| f64::from(n) * 25.0).collect();
        let y: Vec<f64> = x.iter().map(|x| 3.0 - 0.02 * x + 1e-4 * x * x).collect();

        let unscaled = polyfit(&x, &y, 2, None, Scaling::Unscaled).unwrap();
        let scaled = polyfit(&x, &y, 2, None, Scaling::MaxAbs).unwrap();

        for power in 0..=2 {
            approx::assert_relative_eq!(
                unscaled.coefficient(power).value,
                scaled.coefficient(power).value,
                max_relative = 1e-8
            );
        }
    }

    #[test]
    fn exactly_determined_fits_report_zero_errors() {
        let fit = polyfit(&[1.0, 2.0], &[3.0, 5.0], 1, None, Scaling::Unscaled).unwrap();

        approx::assert_relative_eq!(fit.coefficient(1).value, 2.0, max_relative = 1e-10);
        approx::assert_relative_eq!(fit.coefficient(0).uncertainty, 0.0);
        approx::assert_relative_eq!(fit.coefficient(1).uncertainty, 0.0);
    }

    #[test]
    fn underdetermined_fits_are_rejected() {
        let result = polyfit(&[1.0], &[2.0], 1, None, Scaling::Unscaled);
        assert!(matches!(result, Err(Error::FitDidNotConverge(_))));
    }

    #[test]
    fn the_window_covers_the_fitted_points() {
        let fit = polyfit(&X, &Y, 1, None, Scaling::Unscaled).unwrap();
        assert_eq!(fit.window(), (0.0, 4.0));
    }
}
