//! Migration Experiment: end-to-end driver for the patch kernel.
//!
//! This crate plays the scheduler around the kernel:
//! - Splits a periodic cube into patches and particles into patches
//! - Moves particles between patches in periodic migration phases
//! - Runs self and pair force tasks concurrently against the patch boxes
//! - Integrates and ships frames to the collector actor

pub mod config;
pub mod decomposition;
pub mod experiment;
pub mod forces;
pub mod generator;
pub mod results;
