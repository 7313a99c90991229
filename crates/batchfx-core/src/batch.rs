//! Batch layout: N same-sized images stacked in one contiguous buffer.
//!
//! A batch buffer is an ordinary image whose height is
//! `image_height × batch_size`; the format-specific vertical plane
//! multiplier from [`ImageDesc::slot_rows`] turns a slot index into a byte
//! offset.  [`BatchBuffer::slot_view`] is the single addressing mechanism
//! for both packing into and unpacking out of a batch; every transfer
//! helper below goes through it (or through [`BatchBuffer::slot_byte_stride`],
//! which must agree with it byte-for-byte).

use tracing::debug;

use crate::engine::{BufferId, FxEngine, ImageView};
use crate::error::{Error, Result};
use crate::image::{ImageDesc, Layout};

/// One contiguous allocation holding `batch_size` stacked images.
///
/// Owns the engine buffer; slot views never do.
#[derive(Debug)]
pub struct BatchBuffer {
    buffer: BufferId,
    /// Descriptor of the full stacked allocation (height already multiplied).
    full: ImageDesc,
    /// Descriptor of one image in the batch.
    image: ImageDesc,
    batch_size: u32,
}

impl BatchBuffer {
    /// Allocate a batch of `batch_size` images shaped like `template`.
    ///
    /// The allocation has the template's width, format, layout, memory
    /// space, and pitch, with height `template.height × batch_size`.
    pub fn allocate(
        engine: &mut dyn FxEngine,
        template: &ImageDesc,
        batch_size: u32,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Parameter("batch_size must be at least 1".into()));
        }
        // Fails here for geometries with no byte-exact slot boundary.
        template.slot_rows()?;
        let full = template.with_height(
            template
                .height
                .checked_mul(batch_size)
                .ok_or_else(|| Error::Parameter("batch height overflows u32".into()))?,
        );
        let buffer = engine.alloc_image(&full)?;
        debug!(
            batch_size,
            width = full.width,
            height = full.height,
            bytes = full.total_bytes()?,
            "allocated batch buffer"
        );
        Ok(Self {
            buffer,
            full,
            image: *template,
            batch_size,
        })
    }

    /// Release the allocation.
    pub fn release(self, engine: &mut dyn FxEngine) -> Result<()> {
        engine.dealloc_image(self.buffer)
    }

    /// Number of images in the batch.
    #[inline]
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Descriptor of one image in the batch.
    #[inline]
    pub fn image_desc(&self) -> &ImageDesc {
        &self.image
    }

    /// Descriptor of the whole stacked allocation.
    #[inline]
    pub fn full_desc(&self) -> &ImageDesc {
        &self.full
    }

    /// View of the entire stacked buffer.
    pub fn full_view(&self) -> ImageView {
        ImageView::whole(self.buffer, self.full)
    }

    /// Zero-copy view of slot `n`.
    ///
    /// Slot `n` starts at luma-equivalent row `n × image.slot_rows()`, i.e.
    /// byte offset `n × slot_byte_stride()`.
    pub fn slot_view(&self, n: u32) -> Result<ImageView> {
        if n >= self.batch_size {
            return Err(Error::Parameter(format!(
                "slot {n} out of range for batch of {}",
                self.batch_size
            )));
        }
        let offset = n as usize * self.slot_byte_stride()?;
        Ok(ImageView {
            buffer: self.buffer,
            desc: self.image,
            offset,
        })
    }

    /// Byte distance from slot `n` to slot `n + 1`.
    ///
    /// Usable for manual offset iteration as an alternative to recomputing a
    /// view per slot; numerically identical to the delta between consecutive
    /// [`slot_view`](Self::slot_view) offsets.
    pub fn slot_byte_stride(&self) -> Result<usize> {
        Ok(self.image.pitch * self.image.slot_rows()?)
    }
}

// ─── Transfer helpers ────────────────────────────────────────────────────────

/// Transfer one source image into slot `n` of a batch.
pub fn transfer_to_slot(
    engine: &mut dyn FxEngine,
    src: &ImageView,
    dst: &BatchBuffer,
    n: u32,
    scale: f32,
    scratch: Option<BufferId>,
) -> Result<()> {
    let view = dst.slot_view(n)?;
    engine.transfer(src, &view, scale, scratch)
}

/// Transfer slot `n` of a batch out to a destination image.
pub fn transfer_from_slot(
    engine: &mut dyn FxEngine,
    src: &BatchBuffer,
    n: u32,
    dst: &ImageView,
    scale: f32,
    scratch: Option<BufferId>,
) -> Result<()> {
    let view = src.slot_view(n)?;
    engine.transfer(&view, dst, scale, scratch)
}

/// Transfer all slots of one batch into another compatible batch.
///
/// When both batches are chunky, or both are fully planar with the same
/// pixel format, the whole stacked buffer is one legal image and a single
/// transfer covers every slot.  Otherwise the slots are walked one by one
/// through their views, which is safe for every layout pair.
pub fn transfer_batch(
    engine: &mut dyn FxEngine,
    src: &BatchBuffer,
    dst: &BatchBuffer,
    scale: f32,
    scratch: Option<BufferId>,
) -> Result<()> {
    if src.batch_size() != dst.batch_size() {
        return Err(Error::Mismatch(format!(
            "batch sizes differ: {} vs {}",
            src.batch_size(),
            dst.batch_size()
        )));
    }
    let fast = match (src.image.layout, dst.image.layout) {
        (Layout::Chunky, Layout::Chunky) => true,
        (Layout::Planar, Layout::Planar) => src.image.format == dst.image.format,
        _ => false,
    };
    if fast {
        return engine.transfer(&src.full_view(), &dst.full_view(), scale, scratch);
    }
    for n in 0..src.batch_size() {
        engine.transfer(&src.slot_view(n)?, &dst.slot_view(n)?, scale, scratch)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostEngine;
    use crate::image::{ComponentType, MemSpace, PixelFormat};

    fn all_stackable_descs() -> Vec<ImageDesc> {
        let host = MemSpace::Host;
        [
            (PixelFormat::Y, ComponentType::U8, Layout::Chunky),
            (PixelFormat::Bgr, ComponentType::U8, Layout::Chunky),
            (PixelFormat::Rgba, ComponentType::U8, Layout::Chunky),
            (PixelFormat::Bgra, ComponentType::F32, Layout::Chunky),
            (PixelFormat::Rgb, ComponentType::F32, Layout::Planar),
            (PixelFormat::Bgr, ComponentType::U8, Layout::Planar),
            (PixelFormat::Yuv444, ComponentType::U8, Layout::Planar),
            (PixelFormat::Yuv422, ComponentType::U8, Layout::Planar),
            (PixelFormat::Yuv420, ComponentType::U8, Layout::Planar),
        ]
        .into_iter()
        .map(|(f, c, l)| ImageDesc::new(32, 16, f, c, l, host, 1).expect("desc"))
        .collect()
    }

    #[test]
    fn slots_tile_the_batch_exactly() {
        let mut engine = HostEngine::new();
        for template in all_stackable_descs() {
            let batch = BatchBuffer::allocate(&mut engine, &template, 4).expect("alloc");
            let total = batch.full_desc().total_bytes().expect("total");
            let mut covered = 0usize;
            let mut prev_end = 0usize;
            for n in 0..4 {
                let view = batch.slot_view(n).expect("view");
                let len = view.desc.total_bytes().expect("len");
                assert_eq!(
                    view.offset, prev_end,
                    "slot {n} not contiguous for {:?}",
                    template.format
                );
                prev_end = view.offset + len;
                covered += len;
            }
            assert_eq!(covered, total, "slots must sum to batch for {:?}", template.format);
            batch.release(&mut engine).expect("release");
        }
    }

    #[test]
    fn stride_matches_view_delta() {
        let mut engine = HostEngine::new();
        for template in all_stackable_descs() {
            let batch = BatchBuffer::allocate(&mut engine, &template, 3).expect("alloc");
            let stride = batch.slot_byte_stride().expect("stride");
            let v0 = batch.slot_view(0).expect("v0");
            let v1 = batch.slot_view(1).expect("v1");
            assert_eq!(
                v1.offset - v0.offset,
                stride,
                "stride disagrees with views for {:?}",
                template.format
            );
            batch.release(&mut engine).expect("release");
        }
    }

    #[test]
    fn slot_index_bounds_checked() {
        let mut engine = HostEngine::new();
        let template = ImageDesc::new(
            8,
            8,
            PixelFormat::Bgr,
            ComponentType::U8,
            Layout::Chunky,
            MemSpace::Host,
            1,
        )
        .expect("desc");
        let batch = BatchBuffer::allocate(&mut engine, &template, 2).expect("alloc");
        assert!(batch.slot_view(1).is_ok());
        assert_eq!(batch.slot_view(2).unwrap_err().error_code(), 100);
    }

    #[test]
    fn odd_height_420_cannot_batch() {
        let mut engine = HostEngine::new();
        let template = ImageDesc::with_pitch(
            16,
            5,
            PixelFormat::Yuv420,
            ComponentType::U8,
            Layout::Planar,
            MemSpace::Host,
            16,
        )
        .expect("desc");
        let err = BatchBuffer::allocate(&mut engine, &template, 2).unwrap_err();
        assert_eq!(err.error_code(), 103);
    }
}
