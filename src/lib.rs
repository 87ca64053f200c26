//! Asynchronous image-generation jobs
//!
//! Clients submit a generation request, get a job id back immediately, and
//! poll for the outcome while a separate worker process runs the model.
//! Job state lives in a Redis-backed queue.

pub mod app_state;
pub mod client;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
