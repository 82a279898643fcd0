//! Operator process for the Lattice VolumeAutoscaler controller

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// Controller construction and the run loop
pub mod controller_runner;
/// Startup utilities (CRD install, shutdown signals)
pub mod startup;
