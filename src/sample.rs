use std::marker::PhantomData;

use ndarray::Array1;
use ndarray_linalg::Scalar;
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::measure::{quadrature, Measurement, Series};
use crate::saturation::{self, Method, Model};
use crate::Result;

/// Exposed spot area when no collimator radius has been set.
const FALLBACK_SPOT_AREA: f64 = 1e4;

/// Physical constants of the rate conversion, injectable so tests can run
/// with synthetic values.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Constants<E> {
    /// Elementary charge in coulombs.
    pub charge: E,
    /// Mean number of primary ionizations per incident photon.
    pub primary_ionizations: E,
}

impl<E: From<f64>> Default for Constants<E> {
    fn default() -> Self {
        Self {
            charge: E::from(1.6e-19),
            primary_ionizations: E::from(404.0),
        }
    }
}

/// One dataset's raw readings as parallel columns, the exchange format at
/// the crate boundary.
#[derive(Clone, Debug)]
pub struct RawSeries<E> {
    pub stimulus: Vec<E>,
    pub stimulus_error: Vec<E>,
    pub current: Vec<E>,
    pub current_error: Vec<E>,
}

impl<E> Default for RawSeries<E> {
    fn default() -> Self {
        Self {
            stimulus: Vec::new(),
            stimulus_error: Vec::new(),
            current: Vec::new(),
            current_error: Vec::new(),
        }
    }
}

impl<E> RawSeries<E> {
    pub fn push(&mut self, stimulus: E, stimulus_error: E, current: E, current_error: E) {
        self.stimulus.push(stimulus);
        self.stimulus_error.push(stimulus_error);
        self.current.push(current);
        self.current_error.push(current_error);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stimulus.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stimulus.is_empty()
    }
}

/// One dataset: raw readings sorted by stimulus, the gain at the operating
/// point, and every derived series computed on first access and cached until
/// the sample is rebuilt.
#[derive(Clone, Debug)]
pub struct Sample<E: Scalar> {
    name: String,
    stimulus: Series<E>,
    current: Series<E>,
    gain: Measurement<E>,
    method: Method,
    constants: Constants<E>,
    collimator_radius: Option<E>,
    model: Option<Model<E>>,
    linearized: Option<Series<E>>,
    rate: Option<Series<E>>,
    flux: Option<Series<E>>,
    effective_gain: Option<Series<E>>,
}

impl<E: Scalar> Sample<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stimulus values with their errors, sorted ascending.
    pub const fn stimulus(&self) -> &Series<E> {
        &self.stimulus
    }

    /// Raw anode current readings with their errors, co-sorted with the
    /// stimulus.
    pub const fn current(&self) -> &Series<E> {
        &self.current
    }

    /// Gas gain at the group's divider-current operating point.
    pub fn gain(&self) -> Measurement<E> {
        self.gain
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Switch the linearization method, discarding every cached series.
    pub fn set_method(&mut self, method: Method) {
        if method != self.method {
            self.method = method;
            self.model = None;
            self.linearized = None;
            self.rate = None;
            self.flux = None;
            self.effective_gain = None;
        }
    }

    /// Set or clear the collimator radius, discarding the cached flux.
    pub fn set_collimator_radius(&mut self, radius: Option<E>) {
        self.collimator_radius = radius;
        self.flux = None;
    }
}

impl<E> Sample<E>
where
    E: Scalar + PartialOrd + Into<f64> + From<f64>,
{
    /// The linearization model, fitted on first access.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::FitDidNotConverge`] from the underlying fit.
    pub fn model(&mut self) -> Result<&Model<E>> {
        if self.model.is_none() {
            let model = saturation::fit(self.method, &self.stimulus, &self.current)?;
            self.model = Some(model);
        }
        Ok(self.model.as_ref().expect("cached above"))
    }

    /// The linearized current estimate per point, with the fit uncertainty
    /// propagated.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::FitDidNotConverge`] from the underlying fit.
    pub fn linearized_current(&mut self) -> Result<&Series<E>> {
        if self.linearized.is_none() {
            let model = self.model()?.clone();
            self.linearized = Some(model.linearized(&self.stimulus));
        }
        Ok(self.linearized.as_ref().expect("cached above"))
    }

    /// Hit rate per point: the linearized current divided by the charge one
    /// hit deposits at the operating gain.
    ///
    /// # Errors
    ///
    /// [`Error::DivisionByZero`] for a zero gain or zero constants;
    /// otherwise propagates fit errors.
    pub fn rate(&mut self) -> Result<&Series<E>> {
        if self.rate.is_none() {
            let gain = self.gain;
            let charge_per_hit =
                self.constants.charge * self.constants.primary_ionizations * gain.value;
            if charge_per_hit == E::zero() {
                return Err(Error::DivisionByZero("the hit rate"));
            }
            let gain_relative = gain.uncertainty / gain.value;

            let linearized = self.linearized_current()?.clone();
            let rate = Series::from_measurements(linearized.iter().map(|point| {
                let value = point.value / charge_per_hit;
                Measurement {
                    value,
                    uncertainty: quadrature(&[
                        point.uncertainty / charge_per_hit,
                        value * gain_relative,
                    ]),
                }
            }));
            self.rate = Some(rate);
        }
        Ok(self.rate.as_ref().expect("cached above"))
    }

    /// Incident flux per point: the hit rate normalized by the exposed spot
    /// area.
    ///
    /// # Errors
    ///
    /// [`Error::DivisionByZero`] for a zero spot area; otherwise propagates
    /// rate errors.
    pub fn flux(&mut self) -> Result<&Series<E>> {
        if self.flux.is_none() {
            let area = self.spot_area();
            if area == E::zero() {
                return Err(Error::DivisionByZero("the flux"));
            }

            let rate = self.rate()?.clone();
            let flux = Series::from_measurements(rate.iter().map(|point| Measurement {
                value: point.value / area,
                uncertainty: point.uncertainty / area,
            }));
            self.flux = Some(flux);
        }
        Ok(self.flux.as_ref().expect("cached above"))
    }

    /// Effective gain per point: the raw anode current divided by the charge
    /// the hit rate would deposit at unit gain.
    ///
    /// # Errors
    ///
    /// [`Error::DivisionByZero`] for a zero hit rate or a zero raw current;
    /// otherwise propagates rate errors.
    pub fn effective_gain(&mut self) -> Result<&Series<E>> {
        if self.effective_gain.is_none() {
            let charge_per_primary = self.constants.charge * self.constants.primary_ionizations;
            if charge_per_primary == E::zero() {
                return Err(Error::DivisionByZero("the effective gain"));
            }

            let rate = self.rate()?.clone();
            let mut measurements = Vec::with_capacity(self.current.len());
            for (current, rate) in self.current.iter().zip(rate.iter()) {
                if rate.value == E::zero() || current.value == E::zero() {
                    return Err(Error::DivisionByZero("the effective gain"));
                }
                let value = current.value / (charge_per_primary * rate.value);
                measurements.push(Measurement {
                    value,
                    uncertainty: quadrature(&[
                        current.uncertainty / (charge_per_primary * rate.value),
                        value * rate.uncertainty / rate.value,
                    ]),
                });
            }
            self.effective_gain = Some(Series::from_measurements(measurements));
        }
        Ok(self.effective_gain.as_ref().expect("cached above"))
    }

    fn spot_area(&self) -> E {
        self.collimator_radius
            .map_or(<E as From<f64>>::from(FALLBACK_SPOT_AREA), |radius| {
                <E as From<f64>>::from(std::f64::consts::PI) * radius * radius
            })
    }
}

pub enum Set {}
pub enum Unset {}

/// Builder for [`Sample`]; the raw columns must be supplied before `build`
/// becomes available.
pub struct SampleBuilder<E: Scalar, D> {
    name: String,
    gain: Measurement<E>,
    method: Method,
    constants: Constants<E>,
    collimator_radius: Option<E>,
    raw: RawSeries<E>,
    phantom_data: PhantomData<D>,
}

impl<E: Scalar, D> SampleBuilder<E, D> {
    #[must_use]
    pub fn with_constants(mut self, constants: Constants<E>) -> Self {
        self.constants = constants;
        self
    }

    #[must_use]
    pub fn with_collimator_radius(mut self, radius: E) -> Self {
        self.collimator_radius = Some(radius);
        self
    }
}

impl<E: Scalar + From<f64>> SampleBuilder<E, Unset> {
    pub fn new(name: impl Into<String>, gain: Measurement<E>, method: Method) -> Self {
        Self {
            name: name.into(),
            gain,
            method,
            constants: Constants::default(),
            collimator_radius: None,
            raw: RawSeries::default(),
            phantom_data: PhantomData,
        }
    }

    #[must_use]
    pub fn with_data(self, raw: RawSeries<E>) -> SampleBuilder<E, Set> {
        SampleBuilder {
            name: self.name,
            gain: self.gain,
            method: self.method,
            constants: self.constants,
            collimator_radius: self.collimator_radius,
            raw,
            phantom_data: PhantomData,
        }
    }
}

impl<E> SampleBuilder<E, Set>
where
    E: Float + Scalar + PartialOrd,
{
    /// Validate the raw columns and assemble the sample, co-sorting every
    /// column by ascending stimulus.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSampleData`] if the columns are empty or of unequal
    /// length, hold a non-finite entry, a negative stimulus, or a negative
    /// uncertainty.
    pub fn build(self) -> Result<Sample<E>> {
        let RawSeries {
            stimulus,
            stimulus_error,
            current,
            current_error,
        } = self.raw;

        if stimulus.is_empty() {
            return Err(Error::InvalidSampleData(format!(
                "sample `{}` holds no points",
                self.name
            )));
        }
        if stimulus.len() != stimulus_error.len()
            || stimulus.len() != current.len()
            || stimulus.len() != current_error.len()
        {
            return Err(Error::InvalidSampleData(format!(
                "sample `{}` columns differ in length",
                self.name
            )));
        }
        let finite = stimulus
            .iter()
            .chain(&stimulus_error)
            .chain(&current)
            .chain(&current_error)
            .all(|value| Float::is_finite(*value));
        if !finite {
            return Err(Error::InvalidSampleData(format!(
                "sample `{}` holds a non-finite entry",
                self.name
            )));
        }
        if stimulus.iter().any(|&value| value < E::zero()) {
            return Err(Error::InvalidSampleData(format!(
                "sample `{}` holds a negative stimulus",
                self.name
            )));
        }
        if stimulus_error
            .iter()
            .chain(&current_error)
            .any(|&value| value < E::zero())
        {
            return Err(Error::InvalidSampleData(format!(
                "sample `{}` holds a negative uncertainty",
                self.name
            )));
        }

        let mut order: Vec<usize> = (0..stimulus.len()).collect();
        order.sort_by(|&a, &b| stimulus[a].partial_cmp(&stimulus[b]).expect("finite stimulus"));
        let pick = |column: &[E]| Array1::from_iter(order.iter().map(|&index| column[index]));

        let stimulus = Series::new(pick(&stimulus), pick(&stimulus_error));
        let current = Series::new(pick(&current), pick(&current_error));

        Ok(Sample {
            name: self.name,
            stimulus,
            current,
            gain: self.gain,
            method: self.method,
            constants: self.constants,
            collimator_radius: self.collimator_radius,
            model: None,
            linearized: None,
            rate: None,
            flux: None,
            effective_gain: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use crate::error::Error;
    use crate::gain::{GainCurve, Strategy};
    use crate::measure::Measurement;
    use crate::saturation::{Method, Model};

    use super::{Constants, RawSeries, Sample, SampleBuilder};

    const GAIN: f64 = 2e4;

    fn raw(points: &[(f64, f64, f64, f64)]) -> RawSeries<f64> {
        let mut raw = RawSeries::default();
        for &(stimulus, stimulus_error, current, current_error) in points {
            raw.push(stimulus, stimulus_error, current, current_error);
        }
        raw
    }

    /// Exactly linear response with an exact gain, so the first-points fit
    /// reproduces the data and every uncertainty stays small.
    fn linear_sample() -> Sample<f64> {
        let slope = 2e-10;
        let points: Vec<_> = [5.0, 10.0, 20.0, 25.0]
            .iter()
            .map(|&x| (x, 0.0, slope * x, 0.0))
            .collect();
        SampleBuilder::new("linear", Measurement::exact(GAIN), Method::FirstPoints)
            .with_data(raw(&points))
            .build()
            .unwrap()
    }

    #[test]
    fn columns_are_sorted_by_ascending_stimulus() {
        let sample = SampleBuilder::new("shuffled", Measurement::exact(GAIN), Method::FirstPoints)
            .with_data(raw(&[
                (50.0, 0.5, 3e-9, 1e-11),
                (10.0, 0.1, 1e-9, 2e-11),
                (150.0, 1.5, 5e-9, 3e-11),
                (1.0, 0.0, 1e-10, 4e-11),
            ]))
            .build()
            .unwrap();

        assert_eq!(
            sample.stimulus().values().to_vec(),
            vec![1.0, 10.0, 50.0, 150.0]
        );
        assert_eq!(
            sample.current().values().to_vec(),
            vec![1e-10, 1e-9, 3e-9, 5e-9]
        );
        assert_eq!(
            sample.current().errors().to_vec(),
            vec![4e-11, 2e-11, 1e-11, 3e-11]
        );
    }

    #[test]
    fn empty_samples_are_rejected() {
        let result = SampleBuilder::new("empty", Measurement::exact(GAIN), Method::Saturating)
            .with_data(RawSeries::<f64>::default())
            .build();
        assert!(matches!(result, Err(Error::InvalidSampleData(_))));
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let mut ragged = raw(&[(1.0, 0.0, 1e-9, 0.0)]);
        ragged.stimulus.push(2.0);

        let result = SampleBuilder::new("ragged", Measurement::exact(GAIN), Method::Saturating)
            .with_data(ragged)
            .build();
        assert!(matches!(result, Err(Error::InvalidSampleData(_))));
    }

    #[test]
    fn negative_stimulus_values_are_rejected() {
        let result = SampleBuilder::new("negative", Measurement::exact(GAIN), Method::Saturating)
            .with_data(raw(&[(-1.0, 0.0, 1e-9, 0.0), (2.0, 0.0, 2e-9, 0.0)]))
            .build();
        assert!(matches!(result, Err(Error::InvalidSampleData(_))));
    }

    #[test]
    fn negative_uncertainties_are_rejected() {
        let result = SampleBuilder::new("bad_error", Measurement::exact(GAIN), Method::Saturating)
            .with_data(raw(&[(1.0, 0.0, 1e-9, -1e-12), (2.0, 0.0, 2e-9, 0.0)]))
            .build();
        assert!(matches!(result, Err(Error::InvalidSampleData(_))));
    }

    #[test]
    fn non_finite_entries_are_rejected() {
        let result = SampleBuilder::new("nan", Measurement::exact(GAIN), Method::Saturating)
            .with_data(raw(&[(1.0, 0.0, f64::NAN, 0.0), (2.0, 0.0, 2e-9, 0.0)]))
            .build();
        assert!(matches!(result, Err(Error::InvalidSampleData(_))));
    }

    #[test]
    fn rate_follows_the_linearized_current() {
        let mut sample = linear_sample();
        let rate = sample.rate().unwrap().clone();

        let charge_per_hit = 1.6e-19 * 404.0 * GAIN;
        for (index, &x) in [5.0, 10.0, 20.0, 25.0].iter().enumerate() {
            let expected = 2e-10 * x / charge_per_hit;
            approx::assert_relative_eq!(rate.values()[index], expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn derived_series_are_cached_between_calls() {
        let mut sample = linear_sample();

        let first = sample.rate().unwrap().clone();
        let second = sample.rate().unwrap().clone();
        assert_eq!(first, second);

        let flux_first = sample.flux().unwrap().clone();
        let flux_second = sample.flux().unwrap().clone();
        assert_eq!(flux_first, flux_second);
    }

    #[test]
    fn exact_inputs_propagate_exactly_zero_uncertainty() {
        // Two points in the window make the line fit exactly determined, so
        // the parameter errors vanish identically rather than to rounding.
        let mut sample =
            SampleBuilder::new("exact", Measurement::exact(GAIN), Method::FirstPoints)
                .with_data(raw(&[(10.0, 0.0, 2e-9, 0.0), (20.0, 0.0, 4e-9, 0.0)]))
                .build()
                .unwrap();

        assert!(sample
            .linearized_current()
            .unwrap()
            .errors()
            .iter()
            .all(|&error| error == 0.0));
        assert!(sample.rate().unwrap().errors().iter().all(|&error| error == 0.0));
        assert!(sample.flux().unwrap().errors().iter().all(|&error| error == 0.0));
        assert!(sample
            .effective_gain()
            .unwrap()
            .errors()
            .iter()
            .all(|&error| error == 0.0));
    }

    #[test]
    fn effective_gain_matches_the_operating_gain_for_linear_data() {
        // With an unsaturated response the raw and linearized currents agree,
        // so the effective gain collapses to the calibration gain.
        let mut sample = linear_sample();
        let effective = sample.effective_gain().unwrap().clone();

        for &value in effective.values() {
            approx::assert_relative_eq!(value, GAIN, max_relative = 1e-9);
        }
    }

    #[test]
    fn switching_method_replaces_the_cached_model() {
        let mut sample = linear_sample();
        assert!(matches!(
            sample.model().unwrap(),
            Model::FirstPoints { .. }
        ));

        sample.set_method(Method::Saturating);
        assert!(matches!(sample.model().unwrap(), Model::Saturating { .. }));
    }

    #[test]
    fn collimator_radius_rescales_the_flux() {
        let mut sample = linear_sample();
        let fallback = sample.flux().unwrap().clone();

        let radius = 2.5;
        sample.set_collimator_radius(Some(radius));
        let collimated = sample.flux().unwrap().clone();

        let ratio = 1e4 / (std::f64::consts::PI * radius * radius);
        for (index, &value) in collimated.values().iter().enumerate() {
            approx::assert_relative_eq!(
                value,
                fallback.values()[index] * ratio,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn a_zero_collimator_radius_fails_the_flux() {
        let mut sample = linear_sample();
        sample.set_collimator_radius(Some(0.0));

        assert!(matches!(sample.flux(), Err(Error::DivisionByZero(_))));
    }

    #[test]
    fn a_regressed_calibration_feeds_a_saturating_sample_end_to_end() {
        let table = [(10.0, 1e4), (20.0, 2e4), (40.0, 4e4)];
        let curve = GainCurve::build(&table, Strategy::Regression).unwrap();
        let gain = curve.measure(20.0);
        // The tabulated points are not exactly exponential, so the regression
        // lands near the middle node rather than on it.
        approx::assert_relative_eq!(gain.value, 2e4, max_relative = 0.2);

        let mut sample = SampleBuilder::new("chain", gain, Method::Saturating)
            .with_data(raw(&[
                (1.0, 0.0, 1e-9, 0.0),
                (10.0, 0.0, 1e-8, 0.0),
                (50.0, 0.0, 4e-8, 0.0),
                (150.0, 0.0, 4.5e-8, 0.0),
            ]))
            .build()
            .unwrap();

        let linearized = sample.linearized_current().unwrap().clone();
        for (low, high) in linearized.values().iter().tuple_windows() {
            assert!(high >= low);
        }
        for &rate in sample.rate().unwrap().values() {
            assert!(rate.is_finite());
            assert!(rate > 0.0);
        }
    }

    #[test]
    fn zero_constants_fail_instead_of_dividing() {
        let mut sample =
            SampleBuilder::new("degenerate", Measurement::exact(GAIN), Method::FirstPoints)
                .with_constants(Constants {
                    charge: 0.0,
                    primary_ionizations: 404.0,
                })
                .with_data(raw(&[(10.0, 0.0, 2e-9, 0.0), (20.0, 0.0, 4e-9, 0.0)]))
                .build()
                .unwrap();

        assert!(matches!(sample.rate(), Err(Error::DivisionByZero(_))));
    }

    #[test]
    fn zero_raw_current_fails_the_effective_gain() {
        let mut sample =
            SampleBuilder::new("dead-channel", Measurement::exact(GAIN), Method::FirstPoints)
                .with_data(raw(&[(10.0, 0.0, 0.0, 0.0), (20.0, 0.0, 4e-9, 0.0)]))
                .build()
                .unwrap();

        assert!(matches!(
            sample.effective_gain(),
            Err(Error::DivisionByZero(_))
        ));
    }

    #[test]
    fn a_failed_quantity_leaves_earlier_caches_intact() {
        let mut sample =
            SampleBuilder::new("dead-channel", Measurement::exact(GAIN), Method::FirstPoints)
                .with_data(raw(&[(10.0, 0.0, 0.0, 0.0), (20.0, 0.0, 4e-9, 0.0)]))
                .build()
                .unwrap();

        let rate = sample.rate().unwrap().clone();
        let flux = sample.flux().unwrap().clone();
        assert!(matches!(
            sample.effective_gain(),
            Err(Error::DivisionByZero(_))
        ));

        assert_eq!(sample.rate().unwrap(), &rate);
        assert_eq!(sample.flux().unwrap(), &flux);
    }
}
