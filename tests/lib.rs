//! Shared fixtures for permafrost integration tests

pub mod fixtures;
