// ABOUTME: Configuration constants shared across Corral packages
// ABOUTME: Re-exports environment variable names and their documented defaults

pub mod constants;

pub use constants::*;
