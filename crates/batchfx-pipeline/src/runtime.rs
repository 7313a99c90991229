//! Pipeline assembly and the batch processing loop.
//!
//! [`BatchPipeline`] wires one effect to K sources and K sinks:
//! batch buffers and the effect are created once at setup, then the loop
//! fills a batch, invokes the effect, and unpacks each output slot back to
//! the sink of the stream that fed it.  [`ChainedPipeline`] does the same
//! around a two-effect [`ChainedDriver`].
//!
//! Cancellation is cooperative and only observed at batch boundaries; a
//! batch already submitted always completes.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use batchfx_core::batch::{transfer_from_slot, BatchBuffer};
use batchfx_core::engine::{BufferId, FxEngine, ImageView};
use batchfx_core::{Error, ImageDesc, Result};

use crate::config::{FrameGeometry, PipelineConfig};
use crate::driver::{ChainedDriver, EffectDriver, EffectSetup};
use crate::mux::{BatchBuilder, FillOutcome, Frame, FrameSink, FrameSource, SlotAssignment};
use crate::state::StreamStateSet;

/// Counters reported by a completed run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Batched invocations submitted.
    pub batches: u64,
    /// Frames processed (slots filled across all invocations).
    pub frames: u64,
    /// Whether the run stopped on a cancellation request rather than
    /// end of stream.
    pub cancelled: bool,
}

// ─── Shared buffer plumbing ──────────────────────────────────────────────────

/// Batch buffers, staging, and the stream mux shared by both pipeline kinds.
#[derive(Debug)]
struct PipelinePlumbing {
    frame_desc: ImageDesc,
    input: BatchBuffer,
    output: BatchBuffer,
    builder: BatchBuilder,
    /// Host staging image for unpacking one output slot at a time.
    out_staging: BufferId,
    input_scale: f32,
    output_scale: f32,
}

impl PipelinePlumbing {
    fn build(
        engine: &mut dyn FxEngine,
        frame: &FrameGeometry,
        input_template: &ImageDesc,
        output_template: &ImageDesc,
        batch_size: u32,
        num_streams: usize,
        input_scale: f32,
        output_scale: f32,
    ) -> Result<Self> {
        let frame_desc = frame.host_desc()?;
        let input = BatchBuffer::allocate(engine, input_template, batch_size)?;
        let output = match BatchBuffer::allocate(engine, output_template, batch_size) {
            Ok(b) => b,
            Err(e) => {
                input.release(engine)?;
                return Err(e);
            }
        };
        let builder = match BatchBuilder::new(engine, frame_desc, num_streams) {
            Ok(b) => b,
            Err(e) => {
                input.release(engine)?;
                output.release(engine)?;
                return Err(e);
            }
        };
        let out_staging = match engine.alloc_image(&frame_desc) {
            Ok(id) => id,
            Err(e) => {
                builder.release(engine)?;
                input.release(engine)?;
                output.release(engine)?;
                return Err(e);
            }
        };
        Ok(Self {
            frame_desc,
            input,
            output,
            builder,
            out_staging,
            input_scale,
            output_scale,
        })
    }

    /// Download every filled output slot to the sink of its source stream.
    fn unpack(
        &self,
        engine: &mut dyn FxEngine,
        assignment: &SlotAssignment,
        sinks: &mut [Box<dyn FrameSink>],
    ) -> Result<()> {
        let staging = ImageView::whole(self.out_staging, self.frame_desc);
        let frame_bytes = self.frame_desc.total_bytes()?;
        for slot in 0..assignment.len() {
            transfer_from_slot(
                engine,
                &self.output,
                slot as u32,
                &staging,
                self.output_scale,
                None,
            )?;
            let mut data = vec![0u8; frame_bytes];
            engine.download(&staging, &mut data)?;
            let stream = assignment
                .stream_of(slot)
                .ok_or_else(|| Error::Parameter(format!("slot {slot} has no stream")))?;
            sinks[stream].write_frame(&Frame {
                desc: self.frame_desc,
                data,
            })?;
        }
        Ok(())
    }

    fn teardown(self, engine: &mut dyn FxEngine) -> Result<()> {
        self.builder.release(engine)?;
        self.input.release(engine)?;
        self.output.release(engine)?;
        engine.dealloc_image(self.out_staging)
    }
}

fn check_stream_count(num_streams: usize, sinks: usize, sources: usize) -> Result<()> {
    if sources != num_streams || sinks != num_streams {
        return Err(Error::Mismatch(format!(
            "{sources} sources and {sinks} sinks for {num_streams} streams"
        )));
    }
    Ok(())
}

// ─── Single-effect pipeline ──────────────────────────────────────────────────

/// One batched effect over K interleaved streams.
#[derive(Debug)]
pub struct BatchPipeline {
    plumbing: PipelinePlumbing,
    driver: EffectDriver,
    states: StreamStateSet,
    num_streams: usize,
}

impl BatchPipeline {
    /// Allocate buffers, create and load the effect, and allocate one
    /// recurrent state per stream (for stateful effects).
    pub fn new(
        engine: &mut dyn FxEngine,
        cfg: &PipelineConfig,
        num_streams: usize,
    ) -> Result<Self> {
        cfg.validate()?;
        let template = cfg
            .effect_frame
            .as_ref()
            .unwrap_or(&cfg.frame)
            .device_desc()?;
        let plumbing = PipelinePlumbing::build(
            engine,
            &cfg.frame,
            &template,
            &template,
            cfg.batch_size,
            num_streams,
            cfg.input_scale,
            cfg.output_scale,
        )?;

        let setup = EffectSetup {
            selector: cfg.effect.clone(),
            model_dir: cfg.model_dir.clone(),
            batch_size: cfg.batch_size,
            strength: cfg.strength,
            mode: cfg.mode,
        };
        let driver = match EffectDriver::create(
            engine,
            &setup,
            &plumbing.input.slot_view(0)?,
            &plumbing.output.slot_view(0)?,
        ) {
            Ok(d) => d,
            Err(e) => {
                plumbing.teardown(engine)?;
                return Err(e);
            }
        };
        if num_streams as u32 > driver.max_batch() {
            let max_batch = driver.max_batch();
            driver.destroy(engine);
            plumbing.teardown(engine)?;
            return Err(Error::Parameter(format!(
                "{num_streams} streams exceed the loaded variant's batch maximum {max_batch}"
            )));
        }

        let states = if cfg.stateful {
            match StreamStateSet::allocate(engine, driver.effect(), num_streams) {
                Ok(s) => s,
                Err(e) => {
                    driver.destroy(engine);
                    plumbing.teardown(engine)?;
                    return Err(e);
                }
            }
        } else {
            StreamStateSet::stateless(driver.effect(), num_streams)
        };

        info!(
            effect = %cfg.effect,
            num_streams,
            batch_size = cfg.batch_size,
            max_batch = driver.max_batch(),
            stateful = cfg.stateful,
            "pipeline ready"
        );
        Ok(Self {
            plumbing,
            driver,
            states,
            num_streams,
        })
    }

    /// Process every frame of `sources` into `sinks`, one batched
    /// invocation of `num_streams` slots at a time, until a stream ends or
    /// `cancel` is raised.
    pub fn run(
        &mut self,
        engine: &mut dyn FxEngine,
        sources: &mut [Box<dyn FrameSource>],
        sinks: &mut [Box<dyn FrameSink>],
        cancel: &AtomicBool,
    ) -> Result<RunSummary> {
        check_stream_count(self.num_streams, sinks.len(), sources.len())?;
        let fill_count = self.num_streams as u32;
        let mut summary = RunSummary::default();

        loop {
            if cancel.load(Ordering::Relaxed) {
                info!(batches = summary.batches, "cancellation observed");
                summary.cancelled = true;
                break;
            }
            let assignment = match self.plumbing.builder.fill(
                engine,
                sources,
                &self.states,
                &self.plumbing.input,
                fill_count,
                self.plumbing.input_scale,
            )? {
                FillOutcome::Filled(a) => a,
                FillOutcome::EndOfStream => break,
            };
            self.driver.invoke(
                engine,
                &self.plumbing.input,
                &self.plumbing.output,
                assignment.len() as u32,
                &assignment.state_array(),
                false,
            )?;
            self.plumbing.unpack(engine, &assignment, sinks)?;
            summary.batches += 1;
            summary.frames += assignment.len() as u64;
        }
        info!(
            batches = summary.batches,
            frames = summary.frames,
            "run complete"
        );
        Ok(summary)
    }

    /// Release state, destroy the effect, free buffers.  State goes first;
    /// destroying the effect with live state would leave reclamation to the
    /// engine.
    pub fn shutdown(mut self, engine: &mut dyn FxEngine) -> Result<()> {
        if let Err(e) = self.states.release_all(engine) {
            warn!(error = %e, "state release failed; engine will reclaim");
        }
        self.driver.destroy(engine);
        self.plumbing.teardown(engine)
    }
}

// ─── Chained pipeline ────────────────────────────────────────────────────────

/// Configuration for a two-effect chain with a format conversion between
/// the stages.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub first: EffectSetup,
    pub second: EffectSetup,
    /// Host frame geometry of sources and sinks.
    pub frame: FrameGeometry,
    /// Device format both buffers of the first stage use.
    pub first_frame: FrameGeometry,
    /// Device format both buffers of the second stage use.
    pub second_frame: FrameGeometry,
    pub batch_size: u32,
    /// Whether the first stage carries per-stream state (the second stage
    /// of a chain is always stateless).
    pub stateful_first: bool,
    pub input_scale: f32,
    /// Scale of the mid-chain conversion.
    pub inter_scale: f32,
    pub output_scale: f32,
}

/// Two effects in series over K interleaved streams.
#[derive(Debug)]
pub struct ChainedPipeline {
    plumbing: PipelinePlumbing,
    driver: ChainedDriver,
    states: StreamStateSet,
    num_streams: usize,
}

impl ChainedPipeline {
    pub fn new(engine: &mut dyn FxEngine, cfg: &ChainConfig, num_streams: usize) -> Result<Self> {
        // Outer input batch carries the first stage's format, the outer
        // output batch the second's; the intermediates in between are owned
        // by the chained driver.
        let plumbing = PipelinePlumbing::build(
            engine,
            &cfg.frame,
            &cfg.first_frame.device_desc()?,
            &cfg.second_frame.device_desc()?,
            cfg.batch_size,
            num_streams,
            cfg.input_scale,
            cfg.output_scale,
        )?;

        let driver = match ChainedDriver::create(
            engine,
            &cfg.first,
            &cfg.second,
            &plumbing.input,
            &plumbing.output,
            &cfg.first_frame.device_desc()?,
            &cfg.second_frame.device_desc()?,
            cfg.inter_scale,
        ) {
            Ok(d) => d,
            Err(e) => {
                plumbing.teardown(engine)?;
                return Err(e);
            }
        };
        if num_streams as u32 > driver.max_batch() {
            let max_batch = driver.max_batch();
            driver.destroy(engine)?;
            plumbing.teardown(engine)?;
            return Err(Error::Parameter(format!(
                "{num_streams} streams exceed the chain's batch maximum {max_batch}"
            )));
        }

        let states = if cfg.stateful_first {
            match StreamStateSet::allocate(engine, driver.first_effect(), num_streams) {
                Ok(s) => s,
                Err(e) => {
                    driver.destroy(engine)?;
                    plumbing.teardown(engine)?;
                    return Err(e);
                }
            }
        } else {
            StreamStateSet::stateless(driver.first_effect(), num_streams)
        };

        Ok(Self {
            plumbing,
            driver,
            states,
            num_streams,
        })
    }

    pub fn run(
        &mut self,
        engine: &mut dyn FxEngine,
        sources: &mut [Box<dyn FrameSource>],
        sinks: &mut [Box<dyn FrameSink>],
        cancel: &AtomicBool,
    ) -> Result<RunSummary> {
        check_stream_count(self.num_streams, sinks.len(), sources.len())?;
        let fill_count = self.num_streams as u32;
        let mut summary = RunSummary::default();

        loop {
            if cancel.load(Ordering::Relaxed) {
                summary.cancelled = true;
                break;
            }
            let assignment = match self.plumbing.builder.fill(
                engine,
                sources,
                &self.states,
                &self.plumbing.input,
                fill_count,
                self.plumbing.input_scale,
            )? {
                FillOutcome::Filled(a) => a,
                FillOutcome::EndOfStream => break,
            };
            self.driver.invoke(
                engine,
                &self.plumbing.input,
                &self.plumbing.output,
                assignment.len() as u32,
                &assignment.state_array(),
                false,
            )?;
            self.plumbing.unpack(engine, &assignment, sinks)?;
            summary.batches += 1;
            summary.frames += assignment.len() as u64;
        }
        Ok(summary)
    }

    pub fn shutdown(mut self, engine: &mut dyn FxEngine) -> Result<()> {
        if let Err(e) = self.states.release_all(engine) {
            warn!(error = %e, "state release failed; engine will reclaim");
        }
        self.driver.destroy(engine)?;
        self.plumbing.teardown(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchfx_core::host::{HostEngine, FX_PASSTHRU};
    use batchfx_core::image::{ComponentType, Layout, PixelFormat};

    fn base_cfg() -> PipelineConfig {
        PipelineConfig {
            effect: FX_PASSTHRU.into(),
            model_dir: None,
            batch_size: 2,
            strength: None,
            mode: None,
            frame: FrameGeometry {
                width: 16,
                height: 16,
                format: PixelFormat::Bgr,
                component: ComponentType::U8,
                layout: Layout::Chunky,
            },
            effect_frame: None,
            stateful: true,
            input_scale: 1.0,
            output_scale: 1.0,
        }
    }

    #[test]
    fn failed_setup_releases_everything_it_acquired() {
        let mut engine = HostEngine::new();
        // Three streams against a loaded batch maximum of two.
        let err = BatchPipeline::new(&mut engine, &base_cfg(), 3).unwrap_err();
        assert_eq!(err.error_code(), 100);
        assert_eq!(engine.live_buffers(), 0);
        assert_eq!(engine.live_effects(), 0);
        assert_eq!(engine.live_states(), 0);
    }

    #[test]
    fn successful_shutdown_leaves_the_engine_empty() {
        let mut engine = HostEngine::new();
        let pipeline = BatchPipeline::new(&mut engine, &base_cfg(), 2).expect("setup");
        assert_eq!(engine.live_states(), 2);
        pipeline.shutdown(&mut engine).expect("shutdown");
        assert_eq!(engine.live_buffers(), 0);
        assert_eq!(engine.live_effects(), 0);
        assert_eq!(engine.live_states(), 0);
    }
}
