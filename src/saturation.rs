use std::str::FromStr;

use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{Executor, Jacobian, Operator, State};
use argmin::solver::gaussnewton::GaussNewtonLS;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use ndarray::{s, Array1, Array2};
use ndarray_linalg::{Inverse, Scalar};

use crate::error::Error;
use crate::fit::{polyfit, Scaling};
use crate::measure::{quadrature, Measurement, Series};
use crate::Result;

/// Upper edge of the stimulus window where the detector response is trusted
/// to be linear.
const LINEAR_WINDOW: f64 = 30.0;

/// Range partitions split at the largest stimulus not exceeding this target.
const SPLIT_TARGET: f64 = 100.0;

const MAX_ITERATIONS: u64 = 100;

/// Linearization method, parsed from its configuration name.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Method {
    /// One saturating curve over the full stimulus range.
    Saturating,
    /// A plain line through the low-stimulus window only.
    FirstPoints,
    /// Independent low/high saturating fits joined at a data-dependent split.
    TwoPartIndependent,
    /// One continuous two-branch fit with the breakpoint as a parameter.
    PiecewiseContinuous {
        /// Pin the breakpoint to a known transition point instead of fitting
        /// it.
        breakpoint: Option<f64>,
    },
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(name: &str) -> ::std::result::Result<Self, Self::Err> {
        match name {
            "saturating" => Ok(Self::Saturating),
            "firstPoints" => Ok(Self::FirstPoints),
            "twoPartIndependent" => Ok(Self::TwoPartIndependent),
            "piecewiseContinuous" => Ok(Self::PiecewiseContinuous { breakpoint: None }),
            _ => Err(Error::UnsupportedLinearizationMethod(name.to_owned())),
        }
    }
}

/// A fitted linearization model, carrying its parameters with their standard
/// errors and the sub-range(s) each branch applies to.
#[derive(Clone, Debug)]
pub enum Model<E> {
    /// `y = (A x + B) / (1 + tau (A x + B))` over the full domain.
    Saturating {
        slope: Measurement<E>,
        intercept: Measurement<E>,
        tau: Measurement<E>,
    },
    /// A line fitted to the low-stimulus window, extrapolated everywhere.
    FirstPoints {
        slope: Measurement<E>,
        intercept: Measurement<E>,
        window: (E, E),
    },
    /// Saturating fits on each side of the split, the high side pinned to the
    /// low side's linearized value at the threshold.
    TwoPart {
        threshold: E,
        low_slope: Measurement<E>,
        low_intercept: Measurement<E>,
        low_tau: Measurement<E>,
        anchor: Measurement<E>,
        high_slope: Measurement<E>,
        high_tau: Measurement<E>,
    },
    /// One continuous fit with a saturating branch below the breakpoint and
    /// an offset-linear saturating branch above it. A floating breakpoint
    /// ties the high intercept to zero so the branches meet exactly; a pinned
    /// breakpoint frees the intercept to absorb any mismatch at the
    /// transition.
    Piecewise {
        low_slope: Measurement<E>,
        low_intercept: Measurement<E>,
        low_tau: Measurement<E>,
        breakpoint: Measurement<E>,
        high_slope: Measurement<E>,
        high_intercept: Measurement<E>,
        high_tau: Measurement<E>,
    },
}

impl<E: Scalar + PartialOrd> Model<E> {
    /// The linearized (unsaturated) current estimate at one stimulus point,
    /// with the fit and stimulus uncertainties propagated through the branch
    /// the point falls in.
    pub fn linearized_at(&self, stimulus: Measurement<E>) -> Measurement<E> {
        match self {
            Self::Saturating {
                slope, intercept, ..
            }
            | Self::FirstPoints {
                slope, intercept, ..
            } => line(*slope, *intercept, stimulus),
            Self::TwoPart {
                threshold,
                low_slope,
                low_intercept,
                anchor,
                high_slope,
                ..
            } => {
                if stimulus.value <= *threshold {
                    line(*low_slope, *low_intercept, stimulus)
                } else {
                    let offset = stimulus.value - *threshold;
                    Measurement {
                        value: anchor.value + high_slope.value * offset,
                        uncertainty: quadrature(&[
                            anchor.uncertainty,
                            offset * high_slope.uncertainty,
                            high_slope.value * offset * (stimulus.uncertainty / stimulus.value),
                        ]),
                    }
                }
            }
            Self::Piecewise {
                low_slope,
                low_intercept,
                breakpoint,
                high_slope,
                high_intercept,
                ..
            } => {
                if stimulus.value <= breakpoint.value {
                    line(*low_slope, *low_intercept, stimulus)
                } else {
                    let offset = stimulus.value - breakpoint.value;
                    Measurement {
                        value: low_slope.value * breakpoint.value
                            + low_intercept.value
                            + high_slope.value * offset
                            + high_intercept.value,
                        uncertainty: quadrature(&[
                            low_intercept.uncertainty,
                            breakpoint.value * low_slope.uncertainty,
                            high_intercept.uncertainty,
                            offset * high_slope.uncertainty,
                            (low_slope.value - high_slope.value) * breakpoint.uncertainty,
                            high_slope.value * stimulus.uncertainty,
                        ]),
                    }
                }
            }
        }
    }

    /// Linearize a whole stimulus series.
    pub fn linearized(&self, stimulus: &Series<E>) -> Series<E> {
        Series::from_measurements(stimulus.iter().map(|point| self.linearized_at(point)))
    }
}

impl Model<f64> {
    pub(crate) fn convert<E: Scalar + From<f64>>(self) -> Model<E> {
        match self {
            Self::Saturating {
                slope,
                intercept,
                tau,
            } => Model::Saturating {
                slope: slope.convert(),
                intercept: intercept.convert(),
                tau: tau.convert(),
            },
            Self::FirstPoints {
                slope,
                intercept,
                window,
            } => Model::FirstPoints {
                slope: slope.convert(),
                intercept: intercept.convert(),
                window: (
                    <E as From<f64>>::from(window.0),
                    <E as From<f64>>::from(window.1),
                ),
            },
            Self::TwoPart {
                threshold,
                low_slope,
                low_intercept,
                low_tau,
                anchor,
                high_slope,
                high_tau,
            } => Model::TwoPart {
                threshold: <E as From<f64>>::from(threshold),
                low_slope: low_slope.convert(),
                low_intercept: low_intercept.convert(),
                low_tau: low_tau.convert(),
                anchor: anchor.convert(),
                high_slope: high_slope.convert(),
                high_tau: high_tau.convert(),
            },
            Self::Piecewise {
                low_slope,
                low_intercept,
                low_tau,
                breakpoint,
                high_slope,
                high_intercept,
                high_tau,
            } => Model::Piecewise {
                low_slope: low_slope.convert(),
                low_intercept: low_intercept.convert(),
                low_tau: low_tau.convert(),
                breakpoint: breakpoint.convert(),
                high_slope: high_slope.convert(),
                high_intercept: high_intercept.convert(),
                high_tau: high_tau.convert(),
            },
        }
    }
}

/// Evaluate a line with its propagated uncertainty at one stimulus point.
fn line<E: Scalar>(
    slope: Measurement<E>,
    intercept: Measurement<E>,
    at: Measurement<E>,
) -> Measurement<E> {
    Measurement {
        value: slope.value * at.value + intercept.value,
        uncertainty: quadrature(&[
            intercept.uncertainty,
            at.value * slope.uncertainty,
            slope.value * at.uncertainty,
        ]),
    }
}

/// Fit the requested linearization model to a current-vs-stimulus series.
///
/// The stimulus must be sorted ascending; the split-at-threshold methods
/// partition it by position. Samples are built that way.
///
/// The solver runs in `f64`: inputs are converted on the way in and the
/// fitted parameters converted back out. When every current error is
/// positive the fit is weighted by the inverse measurement variances and the
/// parameter errors are absolute; otherwise the errors are scaled by the
/// residual variance at the solution.
///
/// # Errors
///
/// [`Error::FitDidNotConverge`] when a partition holds too few points to
/// constrain its parameters, when the solver exhausts its iteration cap, or
/// when the normal matrix is singular at the solution.
pub fn fit<E>(method: Method, stimulus: &Series<E>, current: &Series<E>) -> Result<Model<E>>
where
    E: Scalar + Into<f64> + From<f64>,
{
    let x: Vec<f64> = stimulus.values().iter().copied().map(Into::into).collect();
    let y: Vec<f64> = current.values().iter().copied().map(Into::into).collect();
    let sigma: Vec<f64> = current.errors().iter().copied().map(Into::into).collect();
    let weights = sigma
        .iter()
        .all(|&error| error > 0.0)
        .then_some(sigma.as_slice());

    log::debug!("linearizing {} points with {:?}", x.len(), method);

    let model = match method {
        Method::Saturating => fit_saturating(&x, &y, weights),
        Method::FirstPoints => fit_first_points(&x, &y, weights),
        Method::TwoPartIndependent => fit_two_part(&x, &y, weights),
        Method::PiecewiseContinuous { breakpoint } => fit_piecewise(&x, &y, weights, breakpoint),
    }?;

    Ok(model.convert())
}

fn fit_saturating(x: &[f64], y: &[f64], sigma: Option<&[f64]>) -> Result<Model<f64>> {
    let fitted = saturating_parameters(x, y, sigma)?;
    Ok(Model::Saturating {
        slope: fitted[0],
        intercept: fitted[1],
        tau: fitted[2],
    })
}

/// Fit the three-parameter saturating curve, answering `[A, B, tau]`.
fn saturating_parameters(
    x: &[f64],
    y: &[f64],
    sigma: Option<&[f64]>,
) -> Result<Vec<Measurement<f64>>> {
    if x.len() <= 3 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points cannot constrain a saturating fit",
            x.len()
        )));
    }

    let scaled = Scaled::build(x, y, sigma);
    let initial = saturating_guess(&scaled.x, &scaled.y)?;
    let factors = [
        scaled.y_scale / scaled.x_scale,
        scaled.y_scale,
        scaled.y_scale.recip(),
    ];
    run_fit(scaled.problem(Kind::Saturating), initial, &factors)
}

fn fit_first_points(x: &[f64], y: &[f64], sigma: Option<&[f64]>) -> Result<Model<f64>> {
    let mut window_x = Vec::new();
    let mut window_y = Vec::new();
    let mut window_sigma = Vec::new();
    for (index, &stimulus) in x.iter().enumerate() {
        if stimulus <= LINEAR_WINDOW {
            window_x.push(stimulus);
            window_y.push(y[index]);
            if let Some(sigma) = sigma {
                window_sigma.push(sigma[index]);
            }
        }
    }
    if window_x.len() < 2 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points below a stimulus of {LINEAR_WINDOW}, need at least 2",
            window_x.len()
        )));
    }

    // The weights are the inverse of the variance.
    let weights: Option<Vec<f64>> = sigma.map(|_| {
        window_sigma
            .iter()
            .map(|error| error.powi(2).recip())
            .collect()
    });
    let fitted = polyfit(
        &window_x,
        &window_y,
        1,
        weights.as_deref(),
        Scaling::Unscaled,
    )?;
    Ok(Model::FirstPoints {
        slope: fitted.coefficient(1),
        intercept: fitted.coefficient(0),
        window: fitted.window(),
    })
}

fn fit_two_part(x: &[f64], y: &[f64], sigma: Option<&[f64]>) -> Result<Model<f64>> {
    let threshold = split_threshold(x)?;
    let split = x.partition_point(|&stimulus| stimulus <= threshold);
    let (low_x, high_x) = x.split_at(split);
    let (low_y, high_y) = y.split_at(split);
    let (low_sigma, high_sigma) = match sigma {
        Some(sigma) => {
            let (low, high) = sigma.split_at(split);
            (Some(low), Some(high))
        }
        None => (None, None),
    };

    if low_x.len() <= 3 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points at or below the split at {threshold} cannot constrain the low fit",
            low_x.len()
        )));
    }
    if high_x.len() <= 2 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points above the split at {threshold} cannot constrain the anchored fit",
            high_x.len()
        )));
    }

    let low = saturating_parameters(low_x, low_y, low_sigma)?;
    let anchor = Measurement {
        value: low[0].value * threshold + low[1].value,
        uncertainty: quadrature(&[low[1].uncertainty, threshold * low[0].uncertainty]),
    };

    let scaled = Scaled::build(high_x, high_y, high_sigma);
    let initial = anchored_guess(
        &scaled.x,
        &scaled.y,
        anchor.value / scaled.y_scale,
        threshold / scaled.x_scale,
        low[0].value * scaled.x_scale / scaled.y_scale,
    );
    let kind = Kind::Anchored {
        anchor: anchor.value / scaled.y_scale,
        threshold: threshold / scaled.x_scale,
    };
    let factors = [scaled.y_scale / scaled.x_scale, scaled.y_scale.recip()];
    let high = run_fit(scaled.problem(kind), initial, &factors)?;

    Ok(Model::TwoPart {
        threshold,
        low_slope: low[0],
        low_intercept: low[1],
        low_tau: low[2],
        anchor,
        high_slope: high[0],
        high_tau: high[1],
    })
}

fn fit_piecewise(
    x: &[f64],
    y: &[f64],
    sigma: Option<&[f64]>,
    fixed_breakpoint: Option<f64>,
) -> Result<Model<f64>> {
    if x.len() <= 7 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points cannot constrain a piecewise fit",
            x.len()
        )));
    }

    let initial_breakpoint = match fixed_breakpoint {
        Some(breakpoint) => breakpoint,
        None => split_threshold(x).unwrap_or_else(|_| x[x.len() / 2]),
    };

    let split = x.partition_point(|&stimulus| stimulus <= initial_breakpoint);
    let (low_x, high_x) = x.split_at(split);
    let (low_y, high_y) = y.split_at(split);
    let (low_sigma, high_sigma) = match sigma {
        Some(sigma) => {
            let (low, high) = sigma.split_at(split);
            (Some(low), Some(high))
        }
        None => (None, None),
    };

    if low_x.len() <= 3 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points at or below the breakpoint at {initial_breakpoint} cannot seed the low branch",
            low_x.len()
        )));
    }
    if high_x.len() <= 3 {
        return Err(Error::FitDidNotConverge(format!(
            "{} points above the breakpoint at {initial_breakpoint} cannot seed the high branch",
            high_x.len()
        )));
    }

    // Coarse independent pre-fits on each half seed the joint fit.
    let low = saturating_parameters(low_x, low_y, low_sigma)?;
    let high = saturating_parameters(high_x, high_y, high_sigma)?;

    let scaled = Scaled::build(x, y, sigma);
    let (x_scale, y_scale) = (scaled.x_scale, scaled.y_scale);

    let mut seed = vec![
        low[0].value * x_scale / y_scale,
        low[1].value / y_scale,
        low[2].value * y_scale,
    ];
    let mut factors = vec![y_scale / x_scale, y_scale, y_scale.recip()];
    if fixed_breakpoint.is_none() {
        seed.push(initial_breakpoint / x_scale);
        factors.push(x_scale);
    }
    seed.push(high[0].value * x_scale / y_scale);
    factors.push(y_scale / x_scale);
    if fixed_breakpoint.is_some() {
        // Start the high branch where its own pre-fit sits at the breakpoint.
        let mismatch = (high[0].value * initial_breakpoint + high[1].value)
            - (low[0].value * initial_breakpoint + low[1].value);
        seed.push(mismatch / y_scale);
        factors.push(y_scale);
    }
    seed.push(high[2].value * y_scale);
    factors.push(y_scale.recip());

    let kind = Kind::Piecewise {
        breakpoint: fixed_breakpoint.map(|breakpoint| breakpoint / x_scale),
    };
    let fitted = run_fit(scaled.problem(kind), Array1::from(seed), &factors)?;

    let model = match fixed_breakpoint {
        Some(breakpoint) => Model::Piecewise {
            low_slope: fitted[0],
            low_intercept: fitted[1],
            low_tau: fitted[2],
            breakpoint: Measurement::exact(breakpoint),
            high_slope: fitted[3],
            high_intercept: fitted[4],
            high_tau: fitted[5],
        },
        None => Model::Piecewise {
            low_slope: fitted[0],
            low_intercept: fitted[1],
            low_tau: fitted[2],
            breakpoint: fitted[3],
            high_slope: fitted[4],
            high_intercept: Measurement::exact(0.0),
            high_tau: fitted[5],
        },
    };
    Ok(model)
}

/// The split point for range partitions: the largest stimulus not exceeding
/// the target, which must leave at least one point on each side.
fn split_threshold(x: &[f64]) -> Result<f64> {
    let threshold = x
        .iter()
        .copied()
        .filter(|&stimulus| stimulus <= SPLIT_TARGET)
        .fold(f64::NEG_INFINITY, f64::max);
    if !threshold.is_finite() || threshold >= x[x.len() - 1] {
        return Err(Error::FitDidNotConverge(format!(
            "stimulus range cannot be split at {SPLIT_TARGET}"
        )));
    }
    Ok(threshold)
}

/// Coarse initial guess for a saturating fit: a line through the low third of
/// the points, and a saturation constant taken from the last point's
/// shortfall against that line.
fn saturating_guess(x: &[f64], y: &[f64]) -> Result<Array1<f64>> {
    let head = (x.len() / 3).max(2);
    let line = polyfit(&x[..head], &y[..head], 1, None, Scaling::Unscaled)?;
    let slope = line.coefficient(1).value;
    let intercept = line.coefficient(0).value;

    let last = x.len() - 1;
    let unsaturated = slope * x[last] + intercept;
    let observed = y[last];
    let tau = if unsaturated > 0.0 && observed > 0.0 {
        ((unsaturated - observed) / (unsaturated * observed)).max(0.0)
    } else {
        0.0
    };

    Ok(Array1::from(vec![slope, intercept, tau]))
}

/// Initial guess for the anchored high-side fit, in scaled units. The low
/// side's slope seeds the trend and the last point's shortfall against it
/// seeds the saturation constant.
fn anchored_guess(x: &[f64], y: &[f64], anchor: f64, threshold: f64, slope: f64) -> Array1<f64> {
    let last = x.len() - 1;
    let unsaturated = anchor + slope * (x[last] - threshold);
    let observed = y[last];
    let tau = if unsaturated > 0.0 && observed > 0.0 {
        ((unsaturated - observed) / (unsaturated * observed)).max(0.0)
    } else {
        0.0
    };

    Array1::from(vec![slope, tau])
}

/// Solve `problem` from `initial` and map the parameters and their standard
/// errors back to data units.
fn run_fit(
    problem: Problem,
    initial: Array1<f64>,
    factors: &[f64],
) -> Result<Vec<Measurement<f64>>> {
    let solution = problem.clone().solve(initial)?;
    let errors = problem.standard_errors(&solution)?;

    Ok(solution
        .iter()
        .zip(&errors)
        .zip(factors)
        .map(|((&value, &error), &factor)| Measurement {
            value: value * factor,
            uncertainty: error * factor,
        })
        .collect())
}

/// Fit inputs rescaled to order unity. Anode currents sit around 1e-9, far
/// below the solver's cost tolerance, so the solver sees `x / x_scale` and
/// `y / y_scale` and the parameters are mapped back afterwards.
struct Scaled {
    x: Vec<f64>,
    y: Vec<f64>,
    sigma: Option<Vec<f64>>,
    x_scale: f64,
    y_scale: f64,
}

impl Scaled {
    fn build(x: &[f64], y: &[f64], sigma: Option<&[f64]>) -> Self {
        let x_scale = max_abs(x);
        let y_scale = max_abs(y);
        Self {
            x: x.iter().map(|&value| value / x_scale).collect(),
            y: y.iter().map(|&value| value / y_scale).collect(),
            sigma: sigma.map(|sigma| sigma.iter().map(|&value| value / y_scale).collect()),
            x_scale,
            y_scale,
        }
    }

    fn problem(&self, kind: Kind) -> Problem {
        Problem {
            x: Array1::from(self.x.clone()),
            y: Array1::from(self.y.clone()),
            sigma: self.sigma.clone().map(Array1::from),
            kind,
        }
    }
}

fn max_abs(values: &[f64]) -> f64 {
    let largest = values
        .iter()
        .fold(0.0_f64, |largest, &value| largest.max(value.abs()));
    if largest > 0.0 {
        largest
    } else {
        1.0
    }
}

/// `u / (1 + tau u)`: the saturated response to an unsaturated current `u`.
fn saturate(unsaturated: f64, tau: f64) -> f64 {
    unsaturated / (1.0 + tau * unsaturated)
}

/// Which saturating shape the residuals are built from.
///
/// Parameter layouts: `Saturating` is `[A, B, tau]`; `Anchored` is
/// `[A, tau]` with the anchor value and threshold held fixed; `Piecewise`
/// with a pinned breakpoint is `[A1, B1, tau1, A2, B2, tau2]` and with a
/// floating breakpoint `[A1, B1, tau1, x0, A2, tau2]`, the high intercept
/// held at zero so the branches meet at `x0` by construction.
#[derive(Clone)]
enum Kind {
    Saturating,
    Anchored { anchor: f64, threshold: f64 },
    Piecewise { breakpoint: Option<f64> },
}

impl Kind {
    fn evaluate(&self, p: &Array1<f64>, x: f64) -> f64 {
        match *self {
            Self::Saturating => saturate(p[0] * x + p[1], p[2]),
            Self::Anchored { anchor, threshold } => {
                saturate(anchor + p[0] * (x - threshold), p[1])
            }
            Self::Piecewise { breakpoint } => {
                let (x0, slope, offset, tau) = match breakpoint {
                    Some(x0) => (x0, p[3], p[4], p[5]),
                    None => (p[3], p[4], 0.0, p[5]),
                };
                if x <= x0 {
                    saturate(p[0] * x + p[1], p[2])
                } else {
                    saturate(p[0] * x0 + p[1] + slope * (x - x0) + offset, tau)
                }
            }
        }
    }

    fn gradient(&self, p: &Array1<f64>, x: f64) -> Vec<f64> {
        match *self {
            Self::Saturating => {
                let unsaturated = p[0] * x + p[1];
                let damping = (1.0 + p[2] * unsaturated).powi(-2);
                vec![x * damping, damping, -unsaturated.powi(2) * damping]
            }
            Self::Anchored { anchor, threshold } => {
                let unsaturated = anchor + p[0] * (x - threshold);
                let damping = (1.0 + p[1] * unsaturated).powi(-2);
                vec![
                    (x - threshold) * damping,
                    -unsaturated.powi(2) * damping,
                ]
            }
            Self::Piecewise { breakpoint } => {
                let (x0, slope, offset, tau) = match breakpoint {
                    Some(x0) => (x0, p[3], p[4], p[5]),
                    None => (p[3], p[4], 0.0, p[5]),
                };
                let mut row = vec![0.0; p.len()];
                if x <= x0 {
                    let unsaturated = p[0] * x + p[1];
                    let damping = (1.0 + p[2] * unsaturated).powi(-2);
                    row[0] = x * damping;
                    row[1] = damping;
                    row[2] = -unsaturated.powi(2) * damping;
                } else {
                    let unsaturated = p[0] * x0 + p[1] + slope * (x - x0) + offset;
                    let damping = (1.0 + tau * unsaturated).powi(-2);
                    row[0] = x0 * damping;
                    row[1] = damping;
                    if breakpoint.is_some() {
                        row[3] = (x - x0) * damping;
                        row[4] = damping;
                    } else {
                        row[3] = (p[0] - slope) * damping;
                        row[4] = (x - x0) * damping;
                    }
                    row[5] = -unsaturated.powi(2) * damping;
                }
                row
            }
        }
    }
}

/// The least-squares residual problem handed to the solver. Residuals are
/// `model - observation`, divided through by the measurement errors when the
/// fit is weighted.
#[derive(Clone)]
struct Problem {
    x: Array1<f64>,
    y: Array1<f64>,
    sigma: Option<Array1<f64>>,
    kind: Kind,
}

impl Problem {
    fn compute(&self, params: &Array1<f64>) -> Array1<f64> {
        self.x.mapv(|x| self.kind.evaluate(params, x))
    }

    /// Run the optimisation.
    fn solve(self, initial_parameters: Array1<f64>) -> Result<Array1<f64>> {
        let linesearch = MoreThuenteLineSearch::new().with_bounds(0.0, 1.0)?;
        let solver = GaussNewtonLS::new(linesearch).with_tolerance(std::f64::EPSILON.sqrt())?;

        let res = Executor::new(self, solver)
            .configure(|state| state.param(initial_parameters).max_iters(MAX_ITERATIONS))
            .add_observer(SlogLogger::term(), ObserverMode::Always)
            .run()?;

        let mut state = res.state().clone();
        if state.get_iter() >= MAX_ITERATIONS {
            return Err(Error::FitDidNotConverge(format!(
                "no convergence within {MAX_ITERATIONS} iterations"
            )));
        }
        let params = state
            .take_param()
            .ok_or_else(|| Error::FitDidNotConverge("solver returned no parameters".into()))?;
        if params.iter().any(|value| !value.is_finite()) {
            return Err(Error::FitDidNotConverge(
                "solver produced non-finite parameters".into(),
            ));
        }
        Ok(params)
    }

    /// Standard errors of the parameters at the converged solution.
    ///
    /// Weighted residuals already carry the measurement variances, so the
    /// covariance is `(J^T J)^-1` directly; unweighted fits rescale it by the
    /// residual variance at the solution.
    #[allow(clippy::cast_precision_loss)]
    fn standard_errors(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let jacobian = self.jacobian(params)?;
        let normal = jacobian.t().dot(&jacobian);
        let covariance = normal
            .inv()
            .map_err(|_| Error::FitDidNotConverge("singular normal matrix at the solution".into()))?;

        let scale = if self.sigma.is_some() {
            1.0
        } else {
            let residuals = self.apply(params)?;
            let degrees_of_freedom = (self.x.len() - params.len()) as f64;
            residuals.dot(&residuals) / degrees_of_freedom
        };

        Ok(covariance.diag().mapv(|variance| {
            if variance > 0.0 {
                (variance * scale).sqrt()
            } else {
                0.0
            }
        }))
    }
}

impl Operator for Problem {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        let residuals = self.compute(p) - &self.y;
        Ok(match &self.sigma {
            Some(sigma) => residuals / sigma,
            None => residuals,
        })
    }
}

impl Jacobian for Problem {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let mut jacobian = Array2::zeros((self.x.len(), p.len()));
        for (index, &x) in self.x.iter().enumerate() {
            let mut row = self.kind.gradient(p, x);
            if let Some(sigma) = &self.sigma {
                for element in &mut row {
                    *element /= sigma[index];
                }
            }
            jacobian.slice_mut(s![index, ..]).assign(&Array1::from(row));
        }
        Ok(jacobian)
    }
}
