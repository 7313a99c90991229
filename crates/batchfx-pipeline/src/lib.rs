//! Multi-stream batched effect orchestration.
//!
//! Layered over `batchfx-core`: the [`mux`] interleaves K frame streams
//! into one batch buffer, [`state`] tracks one recurrent-state handle per
//! stream, [`driver`] performs the bind/run protocol against a loaded
//! effect (optionally two chained effects with a conversion between them),
//! and [`runtime`] assembles those into a run loop.
//!
//! # Invariants
//!
//! * Slot `i` of every invocation is filled from stream `i mod K`; output
//!   slot `i` is routed back to that same stream's sink.
//! * No partial batches: an exhausted source abandons the in-progress
//!   invocation entirely.
//! * A stream's recurrent state appears in at most one slot per invocation.
//! * All buffers and effects are created at setup and reused; the steady
//!   state loop performs no allocation besides host frame vectors.

pub mod config;
pub mod driver;
pub mod mux;
pub mod runtime;
pub mod state;

pub use config::{FrameGeometry, PipelineConfig};
pub use driver::{ChainedDriver, EffectDriver, EffectSetup};
pub use mux::{BatchBuilder, FillOutcome, Frame, FrameSink, FrameSource, SlotAssignment};
pub use runtime::{BatchPipeline, ChainConfig, ChainedPipeline, RunSummary};
pub use state::StreamStateSet;
