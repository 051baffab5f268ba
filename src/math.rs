use ndarray::Array2;
use ndarray_linalg::Scalar;

/// Generate the Vandermonde matrix of `degree` for observations `x`
///
/// The Vandermonde matrix is the design matrix of a polynomial least-squares
/// fit: each row is a geometric progression of an individual observation from
/// power `0` to `degree` inclusive.
///
/// # Panics
///
/// The generator panics in the event that `degree` cannot be converted to
/// `i32`. As the maximum value which can be represented by an `i32` is
/// `2_147_483_647i32` this is unlikely to occur so the error probably does not
/// need to be gracefully handled.
///
/// # Examples
///
/// ```
/// use rate_capability::math::vandermonde;
/// use ndarray::arr2;
///
/// let observations: Vec<f64> = vec![2., 3.];
/// let vander = vandermonde(&observations, 2);
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde<T: Copy + Scalar>(x: &[T], degree: usize) -> Array2<T> {
    Array2::from_shape_fn((x.len(), degree + 1), |(row, power)| {
        x[row].powi(i32::try_from(power).expect("{power} doesn't fit in `i32`"))
    })
}
