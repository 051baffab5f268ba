use ndarray::Array1;
use ndarray_linalg::Scalar;

/// A value together with its one-sigma uncertainty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement<E> {
    pub value: E,
    pub uncertainty: E,
}

impl<E: Scalar> Measurement<E> {
    /// A quantity known exactly, carrying zero uncertainty.
    pub fn exact(value: E) -> Self {
        Self {
            value,
            uncertainty: E::zero(),
        }
    }
}

impl Measurement<f64> {
    pub(crate) fn convert<E: From<f64>>(self) -> Measurement<E> {
        Measurement {
            value: self.value.into(),
            uncertainty: self.uncertainty.into(),
        }
    }
}

/// Parallel value/uncertainty arrays aligned to the stimulus axis of the
/// sample that produced them.
#[derive(Clone, Debug, PartialEq)]
pub struct Series<E> {
    values: Array1<E>,
    errors: Array1<E>,
}

impl<E: Scalar> Series<E> {
    /// # Panics
    ///
    /// Panics if the two arrays differ in length.
    pub fn new(values: Array1<E>, errors: Array1<E>) -> Self {
        assert_eq!(values.len(), errors.len());
        Self { values, errors }
    }

    pub fn from_measurements(measurements: impl IntoIterator<Item = Measurement<E>>) -> Self {
        let (values, errors): (Vec<E>, Vec<E>) = measurements
            .into_iter()
            .map(|measurement| (measurement.value, measurement.uncertainty))
            .unzip();
        Self {
            values: Array1::from_vec(values),
            errors: Array1::from_vec(errors),
        }
    }

    pub const fn values(&self) -> &Array1<E> {
        &self.values
    }

    pub const fn errors(&self) -> &Array1<E> {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Measurement<E> {
        Measurement {
            value: self.values[index],
            uncertainty: self.errors[index],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Measurement<E>> + '_ {
        self.values
            .iter()
            .zip(self.errors.iter())
            .map(|(&value, &uncertainty)| Measurement { value, uncertainty })
    }
}

/// Combine independent error terms in quadrature.
pub(crate) fn quadrature<E: Scalar>(terms: &[E]) -> E {
    Scalar::sqrt(
        terms
            .iter()
            .map(|&term| Scalar::powi(term, 2))
            .fold(E::zero(), |acc, term| acc + term),
    )
}
