// src/cli/handlers/mod.rs

// One module per command family.

pub mod commons;
pub mod repository;
pub mod serve;
