//! Phire preamplifier control core
//!
//! Relay-ladder volume, relay-matrix routing and lazy amplifier power,
//! coordinated behind a single hardware lock.

pub mod domain;

pub use domain::*;
