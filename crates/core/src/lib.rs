//! Core library for chunked, session-aware subtitle translation.
//! Subtitles are split into cues, grouped into chunks, translated over a
//! streamed chat conversation and checked for cue-count fidelity.

pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod secrets;
pub mod subtitle;
pub mod translate;
