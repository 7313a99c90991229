//! The opaque effect-engine seam.
//!
//! Everything the batching core needs from an accelerator SDK is expressed
//! as one capability trait: allocate/free image buffers, move pixels between
//! views (with format/space/scale conversion), and drive handle-based
//! effects (create/destroy, typed get/set parameters, load, run,
//! allocate/deallocate per-stream recurrent state).
//!
//! One concrete adapter implements this per backend, with no inheritance
//! hierarchy beyond this single seam.  The in-tree reference adapter is
//! [`crate::host::HostEngine`]; a device-backed adapter would wrap the
//! vendor SDK behind the same trait.

use crate::error::Result;
use crate::image::ImageDesc;

// ─── Handles ─────────────────────────────────────────────────────────────────

/// Opaque handle to an engine-owned pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Opaque handle to a created effect instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EffectId(pub u64);

/// Opaque handle to one stream's recurrent state, created against a specific
/// effect instance.  Width/height/format are implicit in the effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateHandle(pub u64);

/// A zero-copy view into an engine buffer: a descriptor plus the byte offset
/// of the view's first row within the owning allocation.
///
/// The view never owns the memory; the buffer behind `buffer` does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageView {
    /// The owning allocation.
    pub buffer: BufferId,
    /// Geometry of the viewed region.
    pub desc: ImageDesc,
    /// Byte offset of the view within the allocation.
    pub offset: usize,
}

impl ImageView {
    /// View covering a whole buffer from its start.
    pub fn whole(buffer: BufferId, desc: ImageDesc) -> Self {
        Self {
            buffer,
            desc,
            offset: 0,
        }
    }
}

// ─── Parameter selectors ─────────────────────────────────────────────────────

/// String selectors for typed effect parameters.
///
/// A flat namespace shared by every effect; unknown selectors are reported
/// as [`crate::error::Error::Selector`], type mismatches as
/// [`crate::error::Error::Parameter`]; neither is fatal to the process.
pub mod sel {
    /// Directory containing model files (string, set before load).
    pub const MODEL_DIR: &str = "model_dir";
    /// Input image view (image).  For batched runs, slot 0 of the input
    /// batch; the bound batch-size parameter extends it downward.
    pub const INPUT_IMAGE: &str = "input_image";
    /// Output image view (image), slot 0 of the output batch.
    pub const OUTPUT_IMAGE: &str = "output_image";
    /// Requested (before load) or per-run (after load) batch size (u32).
    pub const BATCH_SIZE: &str = "batch_size";
    /// Largest batch size the loaded effect variant supports (u32, get).
    pub const MAX_BATCH_SIZE: &str = "max_batch_size";
    /// Ordered per-slot recurrent state array (state array).
    pub const STATE: &str = "state";
    /// Size in bytes of one stream's recurrent state (u32, get, post-load).
    pub const STATE_SIZE: &str = "state_size";
    /// Effect strength in `[0, 1]` (f32).
    pub const STRENGTH: &str = "strength";
    /// Effect-specific integer mode (u32).
    pub const MODE: &str = "mode";
    /// Output/input scale factor of the effect (u32, get).
    pub const SCALE_FACTOR: &str = "scale_factor";
}

// ─── Capability trait ────────────────────────────────────────────────────────

/// Capability surface of an accelerator effect engine.
///
/// # Ordering contract
///
/// All calls made through one engine instance are issued against a single
/// ordered execution queue: a `transfer` issued before a `run` is observable
/// by that run, and a `run` with `asynchronous = false` has completed when
/// the call returns.  An asynchronous `run` may overlap host work, but the
/// engine must still retire it before any later call that reads its output.
pub trait FxEngine {
    // ── Buffers & transfers ──────────────────────────────────────────
    /// Allocate a pixel buffer of `desc.total_bytes()` in `desc.space`.
    fn alloc_image(&mut self, desc: &ImageDesc) -> Result<BufferId>;

    /// Release a buffer.  Outstanding views become invalid.
    fn dealloc_image(&mut self, id: BufferId) -> Result<()>;

    /// Copy host bytes into a view.  `bytes.len()` must equal the view's
    /// `total_bytes()`.
    fn upload(&mut self, dst: &ImageView, bytes: &[u8]) -> Result<()>;

    /// Copy a view out to host bytes, same size contract as [`upload`](Self::upload).
    fn download(&self, src: &ImageView, bytes: &mut [u8]) -> Result<()>;

    /// Transfer pixels from `src` to `dst`, converting format, component
    /// type, layout, and memory space as needed, multiplying samples by
    /// `scale`.  `scratch` optionally names a staging buffer the engine may
    /// use for multi-hop conversions; engines that need no staging ignore it.
    fn transfer(
        &mut self,
        src: &ImageView,
        dst: &ImageView,
        scale: f32,
        scratch: Option<BufferId>,
    ) -> Result<()>;

    // ── Effects ──────────────────────────────────────────────────────
    /// Instantiate the effect named by `selector`.
    fn create_effect(&mut self, selector: &str) -> Result<EffectId>;

    /// Destroy an effect and everything it still owns.  Recurrent state not
    /// yet deallocated is reclaimed here (the degraded path).
    fn destroy_effect(&mut self, effect: EffectId);

    fn set_u32(&mut self, effect: EffectId, selector: &str, value: u32) -> Result<()>;
    fn set_f32(&mut self, effect: EffectId, selector: &str, value: f32) -> Result<()>;
    fn set_str(&mut self, effect: EffectId, selector: &str, value: &str) -> Result<()>;
    fn set_image(&mut self, effect: EffectId, selector: &str, view: &ImageView) -> Result<()>;

    /// Bind the ordered per-slot state array for the next run.  Entry `i`
    /// is the recurrent state consumed and updated by batch slot `i`, or
    /// `None` for a stateless slot.
    fn set_state_array(
        &mut self,
        effect: EffectId,
        selector: &str,
        states: &[Option<StateHandle>],
    ) -> Result<()>;

    fn get_u32(&self, effect: EffectId, selector: &str) -> Result<u32>;
    fn get_f32(&self, effect: EffectId, selector: &str) -> Result<f32>;

    /// Expensive one-time model load.  The engine may substitute an internal
    /// variant matching the most recently requested batch size; callers must
    /// re-query [`sel::MAX_BATCH_SIZE`] afterwards.
    fn load(&mut self, effect: EffectId) -> Result<()>;

    /// Execute the effect over the currently bound images, state array, and
    /// batch size.  Fail-fast: no automatic retry, no partial batches.
    fn run(&mut self, effect: EffectId, asynchronous: bool) -> Result<()>;

    /// Allocate one stream's recurrent state for a loaded effect.
    fn alloc_state(&mut self, effect: EffectId) -> Result<StateHandle>;

    /// Release one stream's recurrent state.
    fn dealloc_state(&mut self, effect: EffectId, state: StateHandle) -> Result<()>;
}
