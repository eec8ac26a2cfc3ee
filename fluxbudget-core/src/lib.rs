pub mod advection;
pub mod averaging;
pub mod budget;
pub mod cartesian;
pub mod config;
pub mod dataset;
pub mod diagnostics;
pub mod field;
pub mod grid;
pub mod output;
pub mod prepare;
pub mod scheduler;
pub mod sgs;
pub mod stagger;
pub mod store;
pub mod synthetic;
pub mod tendency;
pub mod tiles;
pub mod variables;

pub mod errors;

#[cfg(feature = "python")]
pub mod python;
