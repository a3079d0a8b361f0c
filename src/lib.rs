//! Essentia library indexer - shared modules for the analyzer and the
//! store maintenance binary.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod cue;
pub mod indexer;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod safety;
pub mod store;
pub mod tags;
pub mod walker;
