#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

pub mod error;
pub mod fit;
pub mod gain;
pub mod group;
pub mod io;
pub mod math;
pub mod measure;
pub mod sample;
pub mod saturation;

pub use error::Error;

pub type Result<T> = ::std::result::Result<T, Error>;
