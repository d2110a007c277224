#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod hub;
pub mod mux;
pub mod output;
pub mod task;
