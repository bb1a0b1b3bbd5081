//! Gateway challenge handling for the clearance preflight.

pub mod core;
pub mod detectors;
pub mod pipeline;
pub mod solvers;
