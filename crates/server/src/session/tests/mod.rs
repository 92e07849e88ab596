//! Session actor tests: scenario drives against in-memory collaborators.

pub(crate) mod helpers;

mod apply_engine;
