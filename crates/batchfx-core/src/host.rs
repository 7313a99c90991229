//! Host reference engine.
//!
//! A complete software implementation of the [`FxEngine`] seam, in the same
//! role the vendor SDK's CPU fallback plays: buffers are heap allocations,
//! transfers are pixel loops, and the built-in effects are deliberately
//! trivial (`passthru`, `gain`).  It exists so the batching and pipeline
//! layers can be exercised end to end without an accelerator; a device
//! adapter implements the identical trait against the real SDK.
//!
//! The `HostPinned` and `Device` memory spaces are honored as descriptor
//! attributes but all allocations land on the heap here.
//!
//! # Transfer support
//!
//! - Identity (same format/component/layout): row-wise copy honoring pitch.
//! - RGB family ↔ RGB family (chunky/planar, U8/F32, any channel order):
//!   per-sample conversion with scale and clamping; missing alpha is filled
//!   opaque.
//! - YUV formats: identity only, equal pitch, unit scale.
//!
//! Anything else is a configuration error, never a silent guess.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::engine::{sel, BufferId, EffectId, FxEngine, ImageView, StateHandle};
use crate::error::{Error, Result};
use crate::image::{ComponentType, ImageDesc, Layout, PixelFormat};

// ─── Effects ─────────────────────────────────────────────────────────────────

/// Selector for the identity echo effect.
pub const FX_PASSTHRU: &str = "passthru";
/// Selector for the strength-scaled gain effect.
pub const FX_GAIN: &str = "gain";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EffectKind {
    Passthru,
    Gain,
}

#[derive(Debug)]
struct HostEffect {
    kind: EffectKind,
    model_dir: Option<String>,
    strength: f32,
    mode: u32,
    requested_batch: u32,
    /// Batch variant chosen at load.  `None` until loaded.
    selected_batch: Option<u32>,
    /// Per-run batch size, re-declared before each run.
    run_batch: u32,
    input: Option<ImageView>,
    output: Option<ImageView>,
    states: Vec<Option<StateHandle>>,
}

impl HostEffect {
    fn loaded(&self) -> bool {
        self.selected_batch.is_some()
    }
}

#[derive(Debug)]
struct HostState {
    owner: EffectId,
    /// Frames this stream's state has accumulated; observable through
    /// nothing but useful under a debugger, and it makes state plumbing a
    /// real data dependency.
    frames_seen: u64,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Heap-backed reference implementation of [`FxEngine`].
#[derive(Debug, Default)]
pub struct HostEngine {
    buffers: HashMap<u64, Vec<u8>>,
    effects: HashMap<u64, HostEffect>,
    states: HashMap<u64, HostState>,
    next_id: u64,
}

impl HostEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Number of live image buffers.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live effect handles.
    pub fn live_effects(&self) -> usize {
        self.effects.len()
    }

    /// Number of live stream states.
    pub fn live_states(&self) -> usize {
        self.states.len()
    }

    fn effect(&self, id: EffectId) -> Result<&HostEffect> {
        self.effects
            .get(&id.0)
            .ok_or_else(|| Error::Effect(format!("no such effect handle {id:?}")))
    }

    fn effect_mut(&mut self, id: EffectId) -> Result<&mut HostEffect> {
        self.effects
            .get_mut(&id.0)
            .ok_or_else(|| Error::Effect(format!("no such effect handle {id:?}")))
    }

    /// Copy the bytes a view covers out of its buffer.
    fn view_bytes(&self, view: &ImageView) -> Result<Vec<u8>> {
        let len = view.desc.total_bytes()?;
        let buf = self
            .buffers
            .get(&view.buffer.0)
            .ok_or_else(|| Error::Parameter(format!("no such buffer {:?}", view.buffer)))?;
        let end = view
            .offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                Error::Parameter(format!(
                    "view [{}, {}) exceeds buffer of {} bytes",
                    view.offset,
                    view.offset + len,
                    buf.len()
                ))
            })?;
        Ok(buf[view.offset..end].to_vec())
    }

    fn view_bytes_mut(&mut self, view: &ImageView) -> Result<&mut [u8]> {
        let len = view.desc.total_bytes()?;
        let buf = self
            .buffers
            .get_mut(&view.buffer.0)
            .ok_or_else(|| Error::Parameter(format!("no such buffer {:?}", view.buffer)))?;
        let end = view
            .offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                Error::Parameter(format!(
                    "view [{}, {}) exceeds buffer of {} bytes",
                    view.offset,
                    view.offset + len,
                    buf.len()
                ))
            })?;
        Ok(&mut buf[view.offset..end])
    }

    /// Core conversion: src bytes were already snapshotted, dst is written
    /// in place.  `scale` multiplies every sample.
    fn convert(src_desc: &ImageDesc, src: &[u8], dst_desc: &ImageDesc, dst: &mut [u8], scale: f32) -> Result<()> {
        if src_desc.width != dst_desc.width || src_desc.height != dst_desc.height {
            return Err(Error::Resolution(format!(
                "transfer cannot resize: {}x{} -> {}x{}",
                src_desc.width, src_desc.height, dst_desc.width, dst_desc.height
            )));
        }

        let identical = src_desc.format == dst_desc.format
            && src_desc.component == dst_desc.component
            && src_desc.layout == dst_desc.layout;

        if src_desc.format.is_yuv() || dst_desc.format.is_yuv() {
            if !identical {
                return Err(Error::PixelFormat {
                    format: dst_desc.format,
                    component: dst_desc.component,
                    layout: dst_desc.layout,
                });
            }
            if scale != 1.0 {
                return Err(Error::Parameter(
                    "scaled transfers of YUV data are not supported".into(),
                ));
            }
        }

        if identical && scale == 1.0 {
            return copy_rows(src_desc, src, dst_desc, dst);
        }

        // Sample-wise path: RGB-family only from here on.
        let src_off = src_desc.format.component_offsets().ok_or(Error::PixelFormat {
            format: src_desc.format,
            component: src_desc.component,
            layout: src_desc.layout,
        })?;
        let dst_off = dst_desc.format.component_offsets().ok_or(Error::PixelFormat {
            format: dst_desc.format,
            component: dst_desc.component,
            layout: dst_desc.layout,
        })?;
        // Luma/alpha-only buffers convert to themselves, not across families.
        if src_desc.format != dst_desc.format
            && (src_desc.format.channels() == 1 || dst_desc.format.channels() == 1)
        {
            return Err(Error::PixelFormat {
                format: dst_desc.format,
                component: dst_desc.component,
                layout: dst_desc.layout,
            });
        }

        let opaque = match dst_desc.component {
            ComponentType::U8 => 255.0,
            ComponentType::F32 => 1.0,
        };
        let pairs = [
            (src_off.r, dst_off.r),
            (src_off.g, dst_off.g),
            (src_off.b, dst_off.b),
            (src_off.a, dst_off.a),
        ];
        for y in 0..src_desc.height {
            for x in 0..src_desc.width {
                for (sc, dc) in pairs {
                    let Some(dc) = dc else { continue };
                    let value = match sc {
                        Some(sc) => read_sample(src_desc, src, x, y, sc) * scale,
                        None => opaque,
                    };
                    write_sample(dst_desc, dst, x, y, dc, value);
                }
            }
        }
        Ok(())
    }
}

/// Row-aware identity copy between equal-shape views with possibly
/// different pitches.
fn copy_rows(src_desc: &ImageDesc, src: &[u8], dst_desc: &ImageDesc, dst: &mut [u8]) -> Result<()> {
    if src_desc.pitch == dst_desc.pitch {
        // Same shape, same pitch: the two regions are byte-identical in size.
        dst.copy_from_slice(src);
        return Ok(());
    }
    if src_desc.format.is_yuv() {
        // Sub-sampled chroma rows are narrower than the luma pitch; a
        // pitch-changing copy would need per-plane geometry.
        return Err(Error::PixelFormat {
            format: src_desc.format,
            component: src_desc.component,
            layout: src_desc.layout,
        });
    }
    let rows = src_desc.slot_rows()?;
    let used = src_desc.width as usize * src_desc.row_bytes_per_pixel();
    for r in 0..rows {
        let s = r * src_desc.pitch;
        let d = r * dst_desc.pitch;
        dst[d..d + used].copy_from_slice(&src[s..s + used]);
    }
    Ok(())
}

#[inline]
fn sample_offset(desc: &ImageDesc, x: u32, y: u32, channel: usize) -> usize {
    let cs = desc.component.size();
    match desc.layout {
        Layout::Chunky => {
            y as usize * desc.pitch + x as usize * desc.format.channels() * cs + channel * cs
        }
        Layout::Planar => {
            (channel * desc.height as usize + y as usize) * desc.pitch + x as usize * cs
        }
    }
}

#[inline]
fn read_sample(desc: &ImageDesc, bytes: &[u8], x: u32, y: u32, channel: usize) -> f32 {
    let off = sample_offset(desc, x, y, channel);
    match desc.component {
        ComponentType::U8 => bytes[off] as f32,
        ComponentType::F32 => f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()),
    }
}

#[inline]
fn write_sample(desc: &ImageDesc, bytes: &mut [u8], x: u32, y: u32, channel: usize, value: f32) {
    let off = sample_offset(desc, x, y, channel);
    match desc.component {
        ComponentType::U8 => bytes[off] = value.round().clamp(0.0, 255.0) as u8,
        ComponentType::F32 => bytes[off..off + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

impl FxEngine for HostEngine {
    fn alloc_image(&mut self, desc: &ImageDesc) -> Result<BufferId> {
        let len = desc.total_bytes()?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|_| Error::Memory(len))?;
        bytes.resize(len, 0);
        let id = self.fresh_id();
        self.buffers.insert(id, bytes);
        Ok(BufferId(id))
    }

    fn dealloc_image(&mut self, id: BufferId) -> Result<()> {
        self.buffers
            .remove(&id.0)
            .map(|_| ())
            .ok_or_else(|| Error::Parameter(format!("no such buffer {id:?}")))
    }

    fn upload(&mut self, dst: &ImageView, bytes: &[u8]) -> Result<()> {
        let len = dst.desc.total_bytes()?;
        if bytes.len() != len {
            return Err(Error::Mismatch(format!(
                "upload of {} bytes into a view of {len}",
                bytes.len()
            )));
        }
        self.view_bytes_mut(dst)?.copy_from_slice(bytes);
        Ok(())
    }

    fn download(&self, src: &ImageView, bytes: &mut [u8]) -> Result<()> {
        let len = src.desc.total_bytes()?;
        if bytes.len() != len {
            return Err(Error::Mismatch(format!(
                "download of {} bytes from a view of {len}",
                bytes.len()
            )));
        }
        bytes.copy_from_slice(&self.view_bytes(src)?);
        Ok(())
    }

    fn transfer(
        &mut self,
        src: &ImageView,
        dst: &ImageView,
        scale: f32,
        _scratch: Option<BufferId>,
    ) -> Result<()> {
        // Snapshot the source region first; src and dst may share a buffer.
        let src_bytes = self.view_bytes(src)?;
        let dst_bytes = self.view_bytes_mut(dst)?;
        HostEngine::convert(&src.desc, &src_bytes, &dst.desc, dst_bytes, scale)
    }

    fn create_effect(&mut self, selector: &str) -> Result<EffectId> {
        let kind = match selector {
            FX_PASSTHRU => EffectKind::Passthru,
            FX_GAIN => EffectKind::Gain,
            other => return Err(Error::Effect(format!("unknown effect selector {other:?}"))),
        };
        let id = self.fresh_id();
        self.effects.insert(
            id,
            HostEffect {
                kind,
                model_dir: None,
                strength: 1.0,
                mode: 0,
                requested_batch: 1,
                selected_batch: None,
                run_batch: 1,
                input: None,
                output: None,
                states: Vec::new(),
            },
        );
        debug!(selector, id, "created effect");
        Ok(EffectId(id))
    }

    fn destroy_effect(&mut self, effect: EffectId) {
        if self.effects.remove(&effect.0).is_none() {
            return;
        }
        // Reclaim state the caller never released: tolerated, but degraded.
        let stale: Vec<u64> = self
            .states
            .iter()
            .filter(|(_, s)| s.owner == effect)
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            warn!(
                effect = effect.0,
                count = stale.len(),
                "destroying effect with live stream state; reclaiming"
            );
            for id in stale {
                self.states.remove(&id);
            }
        }
    }

    fn set_u32(&mut self, effect: EffectId, selector: &str, value: u32) -> Result<()> {
        let fx = self.effect_mut(effect)?;
        match selector {
            sel::BATCH_SIZE => {
                if fx.loaded() {
                    fx.run_batch = value;
                } else {
                    fx.requested_batch = value;
                }
                Ok(())
            }
            sel::MODE => {
                fx.mode = value;
                Ok(())
            }
            other => Err(Error::Selector(other.into())),
        }
    }

    fn set_f32(&mut self, effect: EffectId, selector: &str, value: f32) -> Result<()> {
        let fx = self.effect_mut(effect)?;
        match selector {
            sel::STRENGTH => {
                if !(0.0..=1.0).contains(&value) {
                    return Err(Error::Parameter(format!(
                        "strength must be in [0, 1], got {value}"
                    )));
                }
                fx.strength = value;
                Ok(())
            }
            other => Err(Error::Selector(other.into())),
        }
    }

    fn set_str(&mut self, effect: EffectId, selector: &str, value: &str) -> Result<()> {
        let fx = self.effect_mut(effect)?;
        match selector {
            sel::MODEL_DIR => {
                fx.model_dir = Some(value.into());
                Ok(())
            }
            other => Err(Error::Selector(other.into())),
        }
    }

    fn set_image(&mut self, effect: EffectId, selector: &str, view: &ImageView) -> Result<()> {
        let len = view.desc.total_bytes()?;
        let buf_len = self
            .buffers
            .get(&view.buffer.0)
            .ok_or_else(|| Error::Parameter(format!("no such buffer {:?}", view.buffer)))?
            .len();
        if view.offset + len > buf_len {
            return Err(Error::Parameter(format!(
                "image view exceeds its buffer ({} + {len} > {buf_len})",
                view.offset
            )));
        }
        let fx = self.effect_mut(effect)?;
        match selector {
            sel::INPUT_IMAGE => {
                fx.input = Some(*view);
                Ok(())
            }
            sel::OUTPUT_IMAGE => {
                fx.output = Some(*view);
                Ok(())
            }
            other => Err(Error::Selector(other.into())),
        }
    }

    fn set_state_array(
        &mut self,
        effect: EffectId,
        selector: &str,
        states: &[Option<StateHandle>],
    ) -> Result<()> {
        if selector != sel::STATE {
            return Err(Error::Selector(selector.into()));
        }
        for state in states.iter().flatten() {
            let owner = self
                .states
                .get(&state.0)
                .ok_or_else(|| Error::Parameter(format!("unknown state handle {state:?}")))?
                .owner;
            if owner != effect {
                return Err(Error::Parameter(format!(
                    "state {state:?} belongs to effect {owner:?}"
                )));
            }
        }
        self.effect_mut(effect)?.states = states.to_vec();
        Ok(())
    }

    fn get_u32(&self, effect: EffectId, selector: &str) -> Result<u32> {
        let fx = self.effect(effect)?;
        match selector {
            sel::BATCH_SIZE => Ok(fx.run_batch),
            sel::MAX_BATCH_SIZE => fx.selected_batch.ok_or_else(|| {
                Error::Initialization("batch variant is unknown before load".into())
            }),
            sel::MODE => Ok(fx.mode),
            // Host effect state is one 8-byte frame counter.
            sel::STATE_SIZE => {
                if !fx.loaded() {
                    return Err(Error::Initialization(
                        "state size is unknown before load".into(),
                    ));
                }
                Ok(std::mem::size_of::<u64>() as u32)
            }
            sel::SCALE_FACTOR => Ok(1),
            other => Err(Error::Selector(other.into())),
        }
    }

    fn get_f32(&self, effect: EffectId, selector: &str) -> Result<f32> {
        let fx = self.effect(effect)?;
        match selector {
            sel::STRENGTH => Ok(fx.strength),
            other => Err(Error::Selector(other.into())),
        }
    }

    fn load(&mut self, effect: EffectId) -> Result<()> {
        let fx = self.effect_mut(effect)?;
        if fx.requested_batch == 0 {
            return Err(Error::Parameter("requested batch size of 0".into()));
        }
        // The host variants come in every size; a device adapter may pick a
        // different one here, which is why callers re-query MAX_BATCH_SIZE.
        fx.selected_batch = Some(fx.requested_batch);
        fx.run_batch = fx.requested_batch;
        info!(
            effect = effect.0,
            kind = ?fx.kind,
            batch = fx.requested_batch,
            "loaded effect"
        );
        Ok(())
    }

    fn run(&mut self, effect: EffectId, asynchronous: bool) -> Result<()> {
        let (kind, strength, input, output, batch, states) = {
            let fx = self.effect(effect)?;
            let selected = fx
                .selected_batch
                .ok_or_else(|| Error::Initialization("run before load".into()))?;
            let input = fx
                .input
                .ok_or_else(|| Error::MissingInput("input image not bound".into()))?;
            let output = fx
                .output
                .ok_or_else(|| Error::MissingInput("output image not bound".into()))?;
            if fx.run_batch == 0 || fx.run_batch > selected {
                return Err(Error::Parameter(format!(
                    "run batch {} outside loaded variant's [1, {selected}]",
                    fx.run_batch
                )));
            }
            (fx.kind, fx.strength, input, output, fx.run_batch, fx.states.clone())
        };

        if input.desc.width != output.desc.width || input.desc.height != output.desc.height {
            return Err(Error::Resolution(format!(
                "effect input {}x{} does not match output {}x{}",
                input.desc.width, input.desc.height, output.desc.width, output.desc.height
            )));
        }
        if !states.is_empty() {
            if states.len() != batch as usize {
                return Err(Error::Mismatch(format!(
                    "state array of {} entries for batch of {batch}",
                    states.len()
                )));
            }
            let mut seen: Vec<StateHandle> = states.iter().flatten().copied().collect();
            seen.sort_unstable_by_key(|s| s.0);
            let before = seen.len();
            seen.dedup();
            if seen.len() != before {
                return Err(Error::Parameter(
                    "a state handle appears in more than one slot of this invocation".into(),
                ));
            }
        }

        let in_stride = input.desc.pitch * input.desc.slot_rows()?;
        let out_stride = output.desc.pitch * output.desc.slot_rows()?;
        let scale = match kind {
            EffectKind::Passthru => 1.0,
            EffectKind::Gain => strength,
        };
        for n in 0..batch {
            let src = ImageView {
                offset: input.offset + n as usize * in_stride,
                ..input
            };
            let dst = ImageView {
                offset: output.offset + n as usize * out_stride,
                ..output
            };
            self.transfer(&src, &dst, scale, None)
                .map_err(|e| Error::Launch(format!("slot {n}: {e}")))?;
            if let Some(Some(state)) = states.get(n as usize) {
                if let Some(s) = self.states.get_mut(&state.0) {
                    s.frames_seen += 1;
                }
            }
        }
        debug!(effect = effect.0, batch, asynchronous, "effect run complete");
        Ok(())
    }

    fn alloc_state(&mut self, effect: EffectId) -> Result<StateHandle> {
        let fx = self.effect(effect)?;
        if !fx.loaded() {
            return Err(Error::Initialization(
                "state shape is effect-specific and only known after load".into(),
            ));
        }
        let id = self.fresh_id();
        self.states.insert(
            id,
            HostState {
                owner: effect,
                frames_seen: 0,
            },
        );
        Ok(StateHandle(id))
    }

    fn dealloc_state(&mut self, effect: EffectId, state: StateHandle) -> Result<()> {
        match self.states.get(&state.0) {
            Some(s) if s.owner == effect => {
                self.states.remove(&state.0);
                Ok(())
            }
            Some(s) => Err(Error::Parameter(format!(
                "state {state:?} belongs to effect {:?}",
                s.owner
            ))),
            None => Err(Error::Parameter(format!(
                "unknown or already released state {state:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MemSpace;

    fn host_desc(
        w: u32,
        h: u32,
        format: PixelFormat,
        component: ComponentType,
        layout: Layout,
    ) -> ImageDesc {
        ImageDesc::new(w, h, format, component, layout, MemSpace::Host, 1).expect("desc")
    }

    fn checkered_bgr(w: u32, h: u32) -> Vec<u8> {
        let mut data = vec![0u8; (w * h * 3) as usize];
        for (i, px) in data.chunks_exact_mut(3).enumerate() {
            px[0] = (i % 251) as u8;
            px[1] = (i % 127) as u8;
            px[2] = (i % 83) as u8;
        }
        data
    }

    #[test]
    fn identity_transfer_is_bit_exact() {
        let mut engine = HostEngine::new();
        let desc = host_desc(16, 12, PixelFormat::Bgr, ComponentType::U8, Layout::Chunky);
        let a = engine.alloc_image(&desc).expect("a");
        let b = engine.alloc_image(&desc).expect("b");
        let pixels = checkered_bgr(16, 12);
        engine
            .upload(&ImageView::whole(a, desc), &pixels)
            .expect("upload");
        engine
            .transfer(&ImageView::whole(a, desc), &ImageView::whole(b, desc), 1.0, None)
            .expect("transfer");
        let mut out = vec![0u8; pixels.len()];
        engine
            .download(&ImageView::whole(b, desc), &mut out)
            .expect("download");
        assert_eq!(out, pixels);
    }

    #[test]
    fn u8_chunky_to_f32_planar_round_trip() {
        let mut engine = HostEngine::new();
        let u8_desc = host_desc(8, 6, PixelFormat::Bgr, ComponentType::U8, Layout::Chunky);
        let f32_desc = host_desc(8, 6, PixelFormat::Bgr, ComponentType::F32, Layout::Planar);
        let a = engine.alloc_image(&u8_desc).expect("a");
        let f = engine.alloc_image(&f32_desc).expect("f");
        let b = engine.alloc_image(&u8_desc).expect("b");

        let pixels = checkered_bgr(8, 6);
        engine
            .upload(&ImageView::whole(a, u8_desc), &pixels)
            .expect("upload");
        engine
            .transfer(
                &ImageView::whole(a, u8_desc),
                &ImageView::whole(f, f32_desc),
                1.0 / 255.0,
                None,
            )
            .expect("to f32");
        engine
            .transfer(
                &ImageView::whole(f, f32_desc),
                &ImageView::whole(b, u8_desc),
                255.0,
                None,
            )
            .expect("to u8");

        let mut out = vec![0u8; pixels.len()];
        engine
            .download(&ImageView::whole(b, u8_desc), &mut out)
            .expect("download");
        assert_eq!(out, pixels);
    }

    #[test]
    fn channel_reorder_bgr_to_rgba() {
        let mut engine = HostEngine::new();
        let bgr = host_desc(2, 1, PixelFormat::Bgr, ComponentType::U8, Layout::Chunky);
        let rgba = host_desc(2, 1, PixelFormat::Rgba, ComponentType::U8, Layout::Chunky);
        let a = engine.alloc_image(&bgr).expect("a");
        let b = engine.alloc_image(&rgba).expect("b");
        engine
            .upload(&ImageView::whole(a, bgr), &[10, 20, 30, 40, 50, 60])
            .expect("upload");
        engine
            .transfer(&ImageView::whole(a, bgr), &ImageView::whole(b, rgba), 1.0, None)
            .expect("transfer");
        let mut out = vec![0u8; 8];
        engine
            .download(&ImageView::whole(b, rgba), &mut out)
            .expect("download");
        // B G R -> R G B A with opaque alpha fill.
        assert_eq!(out, [30, 20, 10, 255, 60, 50, 40, 255]);
    }

    #[test]
    fn yuv_cross_format_is_rejected() {
        let mut engine = HostEngine::new();
        let yuv = host_desc(8, 8, PixelFormat::Yuv420, ComponentType::U8, Layout::Planar);
        let bgr = host_desc(8, 8, PixelFormat::Bgr, ComponentType::U8, Layout::Chunky);
        let a = engine.alloc_image(&yuv).expect("a");
        let b = engine.alloc_image(&bgr).expect("b");
        let err = engine
            .transfer(&ImageView::whole(a, yuv), &ImageView::whole(b, bgr), 1.0, None)
            .unwrap_err();
        assert_eq!(err.error_code(), 102);
    }

    #[test]
    fn unknown_selector_is_not_fatal() {
        let mut engine = HostEngine::new();
        let fx = engine.create_effect(FX_PASSTHRU).expect("create");
        let err = engine.set_u32(fx, "no_such_knob", 1).unwrap_err();
        assert_eq!(err.error_code(), 101);
        // The effect is still usable.
        assert!(engine.set_u32(fx, sel::BATCH_SIZE, 2).is_ok());
    }

    #[test]
    fn state_requires_load_and_releases_once() {
        let mut engine = HostEngine::new();
        let fx = engine.create_effect(FX_PASSTHRU).expect("create");
        assert_eq!(engine.alloc_state(fx).unwrap_err().error_code(), 303);
        engine.load(fx).expect("load");
        let state = engine.alloc_state(fx).expect("state");
        engine.dealloc_state(fx, state).expect("release");
        assert_eq!(engine.dealloc_state(fx, state).unwrap_err().error_code(), 100);
    }

    #[test]
    fn duplicate_state_in_one_batch_is_rejected() {
        let mut engine = HostEngine::new();
        let desc = host_desc(4, 4, PixelFormat::Bgr, ComponentType::U8, Layout::Chunky);
        let batched = desc.with_height(8);
        let input = engine.alloc_image(&batched).expect("in");
        let output = engine.alloc_image(&batched).expect("out");

        let fx = engine.create_effect(FX_PASSTHRU).expect("create");
        engine.set_u32(fx, sel::BATCH_SIZE, 2).expect("batch");
        engine.load(fx).expect("load");
        let state = engine.alloc_state(fx).expect("state");
        engine
            .set_image(fx, sel::INPUT_IMAGE, &ImageView { buffer: input, desc, offset: 0 })
            .expect("in");
        engine
            .set_image(fx, sel::OUTPUT_IMAGE, &ImageView { buffer: output, desc, offset: 0 })
            .expect("out");
        engine
            .set_state_array(fx, sel::STATE, &[Some(state), Some(state)])
            .expect("states");
        engine.set_u32(fx, sel::BATCH_SIZE, 2).expect("run batch");
        assert_eq!(engine.run(fx, false).unwrap_err().error_code(), 100);
    }
}
