//! Asynchronous image inference pipeline.
//!
//! photopipe ingests user-submitted images, stages them in a durable local
//! cache, dispatches fixed-size batches to external inference endpoints
//! (face detection and recognition, OCR, object detection), consolidates
//! results onto asset records, and replays failed work from a crash-safe
//! retry ledger.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod store;
