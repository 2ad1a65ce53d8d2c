//! recast - batch video conversion driven by ffmpeg
//!
//! Discovers the videos of a directory, converts them with a bounded pool of
//! ffmpeg processes while streaming structured progress, and aggregates the
//! results into a savings report. Runs can be resumed and interrupted.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod display;
pub mod encoder;
pub mod error;
pub mod inventory;
pub mod job;
pub mod report;
pub mod scheduler;
pub mod setup;
pub mod workflow;
