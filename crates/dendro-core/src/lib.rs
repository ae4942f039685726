pub mod config;
pub mod error;
pub mod estimator;
pub mod jobs;
pub mod object_store;
pub mod photon_flux;
pub mod processors;
pub mod selection;
pub mod series;
pub mod statistics;
pub mod voluseg;

pub use error::{ProcessorError, Result};
