//! Personalized content curation engine.
//!
//! Exposes the batch scoring pipeline, the online ranking engine, and the
//! shared data/model types so both binaries (`curation-api`, `curation-batch`)
//! and the integration tests can build on the same library surface.

pub mod batch;
pub mod cf;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod ranking;
pub mod rules;
