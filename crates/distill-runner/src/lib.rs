//! Distill task runner library
//!
//! Configuration loading and task execution, shared by the binary and tests.

pub mod config;
pub mod run;
