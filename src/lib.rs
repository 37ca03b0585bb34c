//! # queue-tasks
//!
//! Consumes a message queue with a pool of workers and tails a sharded
//! change stream, tracking per-entity migration until every tracked entity
//! has completed.
//!
//! Backends are pluggable (in-process memory, or Postgres with pgmq), and
//! telemetry goes through tracing and OpenTelemetry.

pub mod backend;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod producer;
pub mod telemetry;
pub mod tracker;
