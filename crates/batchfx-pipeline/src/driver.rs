//! Effect invocation: parameter binding, state binding, and run sequencing.
//!
//! One [`EffectDriver`] owns one effect handle and performs the per-call
//! protocol in a fixed order: bind input, bind output, bind the ordered
//! state array, set the dynamic scalars, then run.  Any failure aborts the
//! invocation and is surfaced with the originating stage named; nothing is
//! retried.  [`ChainedDriver`] runs two incompatible-format effects in
//! series with one setup-time conversion buffer between them.

use tracing::{debug, info};

use batchfx_core::batch::{transfer_batch, BatchBuffer};
use batchfx_core::engine::{sel, BufferId, EffectId, FxEngine, ImageView, StateHandle};
use batchfx_core::{Error, ImageDesc, Result};

/// Static description of one effect to instantiate.
#[derive(Clone, Debug)]
pub struct EffectSetup {
    /// Engine effect selector.
    pub selector: String,
    /// Model directory, bound before load when present.
    pub model_dir: Option<String>,
    /// Batch size requested before load; the engine may substitute a
    /// variant, so the driver re-queries the selected maximum.
    pub batch_size: u32,
    /// Strength bound at setup and re-bound per invocation when present.
    pub strength: Option<f32>,
    /// Effect-specific mode, bound once at setup.
    pub mode: Option<u32>,
}

/// Drives one loaded effect over batch buffers.
#[derive(Debug)]
pub struct EffectDriver {
    effect: EffectId,
    /// Maximum batch size of the loaded variant (re-queried after load).
    max_batch: u32,
    strength: Option<f32>,
}

impl EffectDriver {
    /// Create, configure, and load one effect.
    ///
    /// `input` and `output` are slot-0 views of the batch buffers this
    /// effect will run over; by construction they also describe the full
    /// batch once a batch size is bound.
    pub fn create(
        engine: &mut dyn FxEngine,
        setup: &EffectSetup,
        input: &ImageView,
        output: &ImageView,
    ) -> Result<Self> {
        let effect = engine.create_effect(&setup.selector)?;

        let configure = |engine: &mut dyn FxEngine| -> Result<u32> {
            if let Some(dir) = &setup.model_dir {
                engine.set_str(effect, sel::MODEL_DIR, dir)?;
            }
            engine
                .set_image(effect, sel::INPUT_IMAGE, input)
                .map_err(|e| e.at_stage("bind-input"))?;
            engine
                .set_image(effect, sel::OUTPUT_IMAGE, output)
                .map_err(|e| e.at_stage("bind-output"))?;
            engine.set_u32(effect, sel::BATCH_SIZE, setup.batch_size)?;
            if let Some(mode) = setup.mode {
                engine.set_u32(effect, sel::MODE, mode)?;
            }
            if let Some(strength) = setup.strength {
                engine.set_f32(effect, sel::STRENGTH, strength)?;
            }
            engine.load(effect)?;
            // The loaded variant may not match the request.
            engine.get_u32(effect, sel::MAX_BATCH_SIZE)
        };

        match configure(&mut *engine) {
            Ok(max_batch) => {
                if max_batch != setup.batch_size {
                    info!(
                        selector = %setup.selector,
                        requested = setup.batch_size,
                        selected = max_batch,
                        "effect substituted a different batch variant"
                    );
                }
                Ok(Self {
                    effect,
                    max_batch,
                    strength: setup.strength,
                })
            }
            Err(e) => {
                engine.destroy_effect(effect);
                Err(e)
            }
        }
    }

    /// The effect handle (for state allocation).
    pub fn effect(&self) -> EffectId {
        self.effect
    }

    /// Maximum batch size the loaded variant supports.
    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    /// Execute one batched invocation over already-filled buffers.
    ///
    /// `states` must be ordered to match slot order and have exactly
    /// `batch_size` entries.  Failures carry the originating stage:
    /// `bind-input`, `bind-output`, `bind-state`, `bind-params`, or `run`.
    pub fn invoke(
        &self,
        engine: &mut dyn FxEngine,
        input: &BatchBuffer,
        output: &BatchBuffer,
        batch_size: u32,
        states: &[Option<StateHandle>],
        asynchronous: bool,
    ) -> Result<()> {
        if batch_size == 0 || batch_size > self.max_batch {
            return Err(Error::Parameter(format!(
                "invocation batch {batch_size} outside the loaded variant's [1, {}]",
                self.max_batch
            )));
        }
        if states.len() != batch_size as usize {
            return Err(Error::Mismatch(format!(
                "state array of {} entries for batch of {batch_size}",
                states.len()
            )));
        }

        engine
            .set_image(self.effect, sel::INPUT_IMAGE, &input.slot_view(0)?)
            .map_err(|e| e.at_stage("bind-input"))?;
        engine
            .set_image(self.effect, sel::OUTPUT_IMAGE, &output.slot_view(0)?)
            .map_err(|e| e.at_stage("bind-output"))?;
        engine
            .set_state_array(self.effect, sel::STATE, states)
            .map_err(|e| e.at_stage("bind-state"))?;
        // Cheap to re-declare; required whenever the live stream count changes.
        engine
            .set_u32(self.effect, sel::BATCH_SIZE, batch_size)
            .map_err(|e| e.at_stage("bind-params"))?;
        if let Some(strength) = self.strength {
            engine
                .set_f32(self.effect, sel::STRENGTH, strength)
                .map_err(|e| e.at_stage("bind-params"))?;
        }
        engine
            .run(self.effect, asynchronous)
            .map_err(|e| e.at_stage("run"))?;
        debug!(effect = self.effect.0, batch_size, "invocation complete");
        Ok(())
    }

    /// Destroy the effect.  Any state still allocated against it is
    /// reclaimed by the engine (degraded path; release state first).
    pub fn destroy(self, engine: &mut dyn FxEngine) {
        engine.destroy_effect(self.effect);
    }
}

// ─── Chained effects ─────────────────────────────────────────────────────────

/// Two effects in series whose buffer formats differ, with the mandatory
/// conversion transfer between them.
///
/// The intermediate buffers (first's output, second's input) and the
/// conversion scratch buffer are allocated once at setup and reused every
/// invocation, with no per-frame allocation.
#[derive(Debug)]
pub struct ChainedDriver {
    first: EffectDriver,
    second: EffectDriver,
    first_out: BatchBuffer,
    second_in: BatchBuffer,
    scratch: BufferId,
    /// Sample scale of the conversion between the stages
    /// (e.g. 255 for normalized-float → 8-bit).
    inter_scale: f32,
}

impl ChainedDriver {
    /// Create both effects and the intermediate conversion buffers.
    ///
    /// `input`/`output` are the outer batch buffers; `first_out_desc` and
    /// `second_in_desc` describe one image of each intermediate format.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        engine: &mut dyn FxEngine,
        first_setup: &EffectSetup,
        second_setup: &EffectSetup,
        input: &BatchBuffer,
        output: &BatchBuffer,
        first_out_desc: &ImageDesc,
        second_in_desc: &ImageDesc,
        inter_scale: f32,
    ) -> Result<Self> {
        let batch_size = input.batch_size();
        // Both intermediates share the batch size, so the per-image
        // comparison also picks the larger full buffer.
        let first_larger = first_out_desc.total_bytes()? >= second_in_desc.total_bytes()?;

        let first_out = BatchBuffer::allocate(engine, first_out_desc, batch_size)?;
        let second_in = match BatchBuffer::allocate(engine, second_in_desc, batch_size) {
            Ok(b) => b,
            Err(e) => {
                first_out.release(engine)?;
                return Err(e);
            }
        };

        // One scratch buffer serves both directions of the conversion; size
        // it to the larger requirement.
        let scratch_desc = if first_larger {
            *first_out.full_desc()
        } else {
            *second_in.full_desc()
        };
        let scratch = match engine.alloc_image(&scratch_desc) {
            Ok(id) => id,
            Err(e) => {
                first_out.release(engine)?;
                second_in.release(engine)?;
                return Err(e);
            }
        };

        let first = match EffectDriver::create(
            engine,
            first_setup,
            &input.slot_view(0)?,
            &first_out.slot_view(0)?,
        ) {
            Ok(d) => d,
            Err(e) => {
                first_out.release(engine)?;
                second_in.release(engine)?;
                engine.dealloc_image(scratch)?;
                return Err(e);
            }
        };
        let second = match EffectDriver::create(
            engine,
            second_setup,
            &second_in.slot_view(0)?,
            &output.slot_view(0)?,
        ) {
            Ok(d) => d,
            Err(e) => {
                first.destroy(engine);
                first_out.release(engine)?;
                second_in.release(engine)?;
                engine.dealloc_image(scratch)?;
                return Err(e);
            }
        };

        Ok(Self {
            first,
            second,
            first_out,
            second_in,
            scratch,
            inter_scale,
        })
    }

    /// Largest batch both loaded variants support.
    pub fn max_batch(&self) -> u32 {
        self.first.max_batch().min(self.second.max_batch())
    }

    /// The first effect's handle (recurrent state, if any, lives there).
    pub fn first_effect(&self) -> EffectId {
        self.first.effect()
    }

    /// Run first effect → conversion → second effect over one filled batch.
    ///
    /// `states` bind to the first effect; the second stage of this chain is
    /// stateless.
    pub fn invoke(
        &self,
        engine: &mut dyn FxEngine,
        input: &BatchBuffer,
        output: &BatchBuffer,
        batch_size: u32,
        states: &[Option<StateHandle>],
        asynchronous: bool,
    ) -> Result<()> {
        self.first
            .invoke(engine, input, &self.first_out, batch_size, states, asynchronous)?;
        transfer_batch(
            engine,
            &self.first_out,
            &self.second_in,
            self.inter_scale,
            Some(self.scratch),
        )
        .map_err(|e| e.at_stage("convert"))?;
        let stateless = vec![None; batch_size as usize];
        self.second
            .invoke(engine, &self.second_in, output, batch_size, &stateless, asynchronous)
    }

    /// Destroy both effects and release the intermediates.
    pub fn destroy(self, engine: &mut dyn FxEngine) -> Result<()> {
        self.first.destroy(engine);
        self.second.destroy(engine);
        self.first_out.release(engine)?;
        self.second_in.release(engine)?;
        engine.dealloc_image(self.scratch)
    }
}
