//! Hardware register write logging.
//!
//! Each sound chip keeps a [`RegisterLogger`] recording the last value written
//! to every register it maps, with decay timers for "recently written" and
//! "recently changed" highlighting. Diagnostics/visualization only: logging
//! never affects emulation state.

pub mod registers;

pub use registers::{RegisterLogger, RegisterState};
