//! RoundsIQ clinical analysis backend
//!
//! Accepts clinical notes and images, queues them in the shared
//! `clinical_analyses` PostgreSQL table and runs LLM analyses in background
//! claim loops. The API server and the standalone `worker` binary both build
//! on this library.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
