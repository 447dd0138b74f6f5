// src/core/mod.rs

pub mod composer;
pub mod config_loader;
pub mod expression;
pub mod launcher;
pub mod paths;
pub mod pipeline;
pub mod proxy;
pub mod report;
pub mod server;
