//! # System Interaction Layer
//!
//! The boundary between the engines and the operating system.
//!
//! ## Modules
//!
//! - **`environment`**: Captures the shared environment snapshot once, after the
//!   configured Node and pnpm versions have been bootstrapped.
//! - **`executor`**: Spawns child processes and action scripts with that
//!   environment, streams their output and kills them on cancellation.

pub mod environment;
pub mod executor;
