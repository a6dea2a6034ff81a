//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

// helper functions for creating and fsyncing
pub mod crashsafe;

// common log initialisation routine
pub mod logging;
