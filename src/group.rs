use ndarray_linalg::Scalar;
use num_traits::Float;

use crate::gain::GainCurve;
use crate::measure::{Measurement, Series};
use crate::sample::{Constants, RawSeries, Sample, SampleBuilder};
use crate::saturation::Method;
use crate::Result;

/// The flux against effective-gain relation of one sample, one block of the
/// combined rate-capability curve.
#[derive(Clone, Debug, PartialEq)]
pub struct RateCapability<E> {
    pub sample: String,
    pub flux: Series<E>,
    pub effective_gain: Series<E>,
}

/// A set of samples recorded against one gain calibration at one
/// divider-current operating point.
///
/// The group owns its samples; they are visited in the order they were
/// added.
#[derive(Clone, Debug)]
pub struct MeasurementGroup<E: Scalar> {
    calibration: GainCurve<E>,
    divider_current: E,
    gain: Measurement<E>,
    method: Method,
    constants: Constants<E>,
    samples: Vec<Sample<E>>,
}

impl<E> MeasurementGroup<E>
where
    E: Float + Scalar + PartialOrd + Into<f64> + From<f64>,
{
    /// Assemble a group from named raw datasets, evaluating the calibration
    /// once at the operating point and handing that gain to every sample.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSampleData`](crate::Error::InvalidSampleData) if any
    /// dataset fails validation.
    pub fn from_grouped_input(
        series: Vec<(String, RawSeries<E>)>,
        calibration: GainCurve<E>,
        divider_current: E,
        method: Method,
        constants: Constants<E>,
    ) -> Result<Self> {
        let gain = calibration.measure(divider_current);
        let mut group = Self {
            calibration,
            divider_current,
            gain,
            method,
            constants,
            samples: Vec::with_capacity(series.len()),
        };
        for (name, raw) in series {
            group.push(name, raw)?;
        }
        Ok(group)
    }

    /// Add one named dataset to the back of the group.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSampleData`](crate::Error::InvalidSampleData) if the
    /// dataset fails validation.
    pub fn push(&mut self, name: impl Into<String>, raw: RawSeries<E>) -> Result<()> {
        let sample = SampleBuilder::new(name, self.gain, self.method)
            .with_constants(self.constants)
            .with_data(raw)
            .build()?;
        self.samples.push(sample);
        Ok(())
    }

    /// The rate-capability relation of every sample, concatenated in sample
    /// order without averaging.
    ///
    /// Any failing sample aborts the whole call, so no partial output ever
    /// escapes.
    ///
    /// # Errors
    ///
    /// Propagates the first fit or division failure encountered.
    pub fn combined_rate_capability(&mut self) -> Result<Vec<RateCapability<E>>> {
        let mut combined = Vec::with_capacity(self.samples.len());
        for sample in &mut self.samples {
            let flux = sample.flux()?.clone();
            let effective_gain = sample.effective_gain()?.clone();
            combined.push(RateCapability {
                sample: sample.name().to_owned(),
                flux,
                effective_gain,
            });
        }
        Ok(combined)
    }
}

impl<E: Scalar> MeasurementGroup<E> {
    pub const fn calibration(&self) -> &GainCurve<E> {
        &self.calibration
    }

    pub fn divider_current(&self) -> E {
        self.divider_current
    }

    /// Gas gain at the operating point, shared by every sample.
    pub fn gain(&self) -> Measurement<E> {
        self.gain
    }

    pub fn constants(&self) -> Constants<E> {
        self.constants
    }

    pub fn samples(&self) -> &[Sample<E>] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample<E>] {
        &mut self.samples
    }

    pub fn get(&self, name: &str) -> Option<&Sample<E>> {
        self.samples.iter().find(|sample| sample.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Sample<E>> {
        self.samples.iter_mut().find(|sample| sample.name() == name)
    }

    /// Apply one collimator radius to every sample, clearing their cached
    /// fluxes.
    pub fn set_collimator_radius(&mut self, radius: Option<E>) {
        for sample in &mut self.samples {
            sample.set_collimator_radius(radius);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
