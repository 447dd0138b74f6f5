// src/lib.rs

//! # titan
//!
//! Developer-workflow automation: ordered repository actions run concurrently
//! across many checkouts, and a serve mode that launches background
//! applications behind a longest-prefix reverse proxy.

pub use tokio_util::sync::CancellationToken;

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
