//! Stream multiplexer: interleaving K sources into one batch buffer.
//!
//! Slot `i` of an invocation is filled from stream `i mod num_streams`, and
//! the builder records which stream (and which recurrent-state handle) each
//! slot came from in a [`SlotAssignment`] built fresh per invocation.  The
//! steady-state configuration is `batch_size == num_streams`, one slot per
//! stream; a fill that would put one stream's state into two slots of the
//! same invocation is rejected rather than assumed safe.
//!
//! End-of-stream policy: if any assigned source is exhausted mid-fill the
//! whole invocation is abandoned; no partial batches are ever submitted.

use tracing::debug;

use batchfx_core::batch::{transfer_to_slot, BatchBuffer};
use batchfx_core::engine::{BufferId, FxEngine, ImageView, StateHandle};
use batchfx_core::{Error, ImageDesc, Result};

use crate::state::StreamStateSet;

// ─── Frames and sources ──────────────────────────────────────────────────────

/// One host-resident frame: a descriptor plus its packed bytes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub desc: ImageDesc,
    pub data: Vec<u8>,
}

/// A blocking frame producer (file reader, capture device, synthetic
/// generator).  `None` means the stream ended cleanly.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// A blocking frame consumer.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
}

// ─── Slot assignment ─────────────────────────────────────────────────────────

/// For one invocation: which stream and which state handle sits in each
/// slot.  Built fresh per fill; never outlives the invocation.
#[derive(Clone, Debug, Default)]
pub struct SlotAssignment {
    entries: Vec<(usize, Option<StateHandle>)>,
}

impl SlotAssignment {
    /// Number of filled slots (the effective batch size of this invocation).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source stream of slot `slot`.
    pub fn stream_of(&self, slot: usize) -> Option<usize> {
        self.entries.get(slot).map(|(s, _)| *s)
    }

    /// The ordered per-slot state array, ready to bind.
    pub fn state_array(&self) -> Vec<Option<StateHandle>> {
        self.entries.iter().map(|(_, h)| *h).collect()
    }
}

/// Result of one fill attempt.
#[derive(Debug)]
pub enum FillOutcome {
    /// Every slot was filled and converted into the batch.
    Filled(SlotAssignment),
    /// A source ran dry mid-fill; the invocation was abandoned.
    EndOfStream,
}

// ─── Batch builder ───────────────────────────────────────────────────────────

/// Fills a batch buffer from K sources, one frame per slot.
#[derive(Debug)]
pub struct BatchBuilder {
    frame_desc: ImageDesc,
    staging: BufferId,
    num_streams: usize,
}

impl BatchBuilder {
    /// `frame_desc` is the host geometry every source must produce.
    pub fn new(
        engine: &mut dyn FxEngine,
        frame_desc: ImageDesc,
        num_streams: usize,
    ) -> Result<Self> {
        if num_streams == 0 {
            return Err(Error::Parameter("at least one stream is required".into()));
        }
        let staging = engine.alloc_image(&frame_desc)?;
        Ok(Self {
            frame_desc,
            staging,
            num_streams,
        })
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    /// Release the staging buffer.
    pub fn release(self, engine: &mut dyn FxEngine) -> Result<()> {
        engine.dealloc_image(self.staging)
    }

    /// Fill `fill_count` slots of `batch`, drawing slot `i` from stream
    /// `i mod num_streams`, converting each frame through the engine with
    /// `scale`.
    ///
    /// Fails with a configuration error if two slots would carry the same
    /// stream's state handle within this one invocation.
    pub fn fill(
        &mut self,
        engine: &mut dyn FxEngine,
        sources: &mut [Box<dyn FrameSource>],
        states: &StreamStateSet,
        batch: &BatchBuffer,
        fill_count: u32,
        scale: f32,
    ) -> Result<FillOutcome> {
        if sources.len() != self.num_streams {
            return Err(Error::Mismatch(format!(
                "{} sources for a builder of {} streams",
                sources.len(),
                self.num_streams
            )));
        }
        if fill_count == 0 || fill_count > batch.batch_size() {
            return Err(Error::Parameter(format!(
                "cannot fill {fill_count} slots of a batch of {}",
                batch.batch_size()
            )));
        }

        let mut assignment = SlotAssignment::default();
        for slot in 0..fill_count {
            let stream = slot as usize % self.num_streams;
            let handle = states.handle(stream)?;
            if handle.is_some() && assignment.entries.iter().any(|(s, _)| *s == stream) {
                return Err(Error::Parameter(format!(
                    "stream {stream} would occupy two slots of one invocation; \
                     a stateful batch needs batch_size <= num_streams"
                )));
            }

            let Some(frame) = sources[stream].next_frame()? else {
                debug!(slot, stream, "source exhausted; abandoning invocation");
                return Ok(FillOutcome::EndOfStream);
            };
            if !frame.desc.same_shape(&self.frame_desc) {
                return Err(Error::Mismatch(format!(
                    "stream {stream} produced {}x{} {:?}, expected {}x{} {:?}; \
                     batching requires identically sized frames",
                    frame.desc.width,
                    frame.desc.height,
                    frame.desc.format,
                    self.frame_desc.width,
                    self.frame_desc.height,
                    self.frame_desc.format,
                )));
            }

            let staging_view = ImageView::whole(self.staging, self.frame_desc);
            engine.upload(&staging_view, &frame.data)?;
            transfer_to_slot(engine, &staging_view, batch, slot, scale, None)?;
            assignment.entries.push((stream, handle));
        }
        Ok(FillOutcome::Filled(assignment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchfx_core::engine::sel;
    use batchfx_core::host::{HostEngine, FX_PASSTHRU};
    use batchfx_core::image::{ComponentType, Layout, MemSpace, PixelFormat};

    fn bgr_desc(w: u32, h: u32) -> ImageDesc {
        ImageDesc::new(
            w,
            h,
            PixelFormat::Bgr,
            ComponentType::U8,
            Layout::Chunky,
            MemSpace::Host,
            1,
        )
        .expect("desc")
    }

    /// A source producing frames whose every byte equals a stream tag.
    struct TaggedSource {
        desc: ImageDesc,
        tag: u8,
        remaining: usize,
    }

    impl FrameSource for TaggedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let len = self.desc.total_bytes()?;
            Ok(Some(Frame {
                desc: self.desc,
                data: vec![self.tag; len],
            }))
        }
    }

    fn sources(desc: ImageDesc, count: usize, frames: usize) -> Vec<Box<dyn FrameSource>> {
        (0..count)
            .map(|i| {
                Box::new(TaggedSource {
                    desc,
                    tag: (i + 1) as u8 * 10,
                    remaining: frames,
                }) as Box<dyn FrameSource>
            })
            .collect()
    }

    fn stateful_setup(
        engine: &mut HostEngine,
        num_streams: usize,
        batch: u32,
    ) -> (StreamStateSet, BatchBuffer, BatchBuilder, ImageDesc) {
        let desc = bgr_desc(8, 4);
        let fx = engine.create_effect(FX_PASSTHRU).expect("create");
        engine.set_u32(fx, sel::BATCH_SIZE, batch).expect("batch");
        engine.load(fx).expect("load");
        let states = StreamStateSet::allocate(engine, fx, num_streams).expect("states");
        let buffer = BatchBuffer::allocate(engine, &desc, batch).expect("batch buffer");
        let builder = BatchBuilder::new(engine, desc, num_streams).expect("builder");
        (states, buffer, builder, desc)
    }

    #[test]
    fn slot_i_draws_from_stream_i() {
        let mut engine = HostEngine::new();
        let (mut states, batch, mut builder, desc) = stateful_setup(&mut engine, 3, 3);
        let mut srcs = sources(desc, 3, 2);

        let FillOutcome::Filled(assignment) = builder
            .fill(&mut engine, &mut srcs, &states, &batch, 3, 1.0)
            .expect("fill")
        else {
            panic!("unexpected end of stream");
        };

        assert_eq!(assignment.len(), 3);
        for slot in 0..3 {
            assert_eq!(assignment.stream_of(slot), Some(slot));
        }
        // Slot n carries stream n's tag bytes.
        let stride = batch.slot_byte_stride().expect("stride");
        let mut all = vec![0u8; batch.full_desc().total_bytes().expect("total")];
        engine.download(&batch.full_view(), &mut all).expect("download");
        for slot in 0..3usize {
            let tag = (slot as u8 + 1) * 10;
            assert!(all[slot * stride..(slot + 1) * stride].iter().all(|b| *b == tag));
        }
        states.release_all(&mut engine).expect("release");
    }

    #[test]
    fn exhausted_source_abandons_whole_invocation() {
        let mut engine = HostEngine::new();
        let (mut states, batch, mut builder, desc) = stateful_setup(&mut engine, 2, 2);
        // Stream 1 has one frame fewer: second fill must abandon.
        let mut srcs: Vec<Box<dyn FrameSource>> = vec![
            Box::new(TaggedSource { desc, tag: 10, remaining: 2 }),
            Box::new(TaggedSource { desc, tag: 20, remaining: 1 }),
        ];

        assert!(matches!(
            builder
                .fill(&mut engine, &mut srcs, &states, &batch, 2, 1.0)
                .expect("first fill"),
            FillOutcome::Filled(_)
        ));
        assert!(matches!(
            builder
                .fill(&mut engine, &mut srcs, &states, &batch, 2, 1.0)
                .expect("second fill"),
            FillOutcome::EndOfStream
        ));
        states.release_all(&mut engine).expect("release");
    }

    #[test]
    fn mismatched_frame_size_is_rejected() {
        let mut engine = HostEngine::new();
        let (mut states, batch, mut builder, _) = stateful_setup(&mut engine, 2, 2);
        let mut srcs: Vec<Box<dyn FrameSource>> = vec![
            Box::new(TaggedSource { desc: bgr_desc(8, 4), tag: 1, remaining: 1 }),
            Box::new(TaggedSource { desc: bgr_desc(16, 4), tag: 2, remaining: 1 }),
        ];
        let err = builder
            .fill(&mut engine, &mut srcs, &states, &batch, 2, 1.0)
            .unwrap_err();
        assert_eq!(err.error_code(), 104);
        states.release_all(&mut engine).expect("release");
    }

    #[test]
    fn duplicate_stateful_stream_in_one_batch_is_rejected() {
        let mut engine = HostEngine::new();
        let (mut states, batch, mut builder, desc) = stateful_setup(&mut engine, 2, 4);
        let mut srcs = sources(desc, 2, 4);
        let err = builder
            .fill(&mut engine, &mut srcs, &states, &batch, 4, 1.0)
            .unwrap_err();
        assert_eq!(err.error_code(), 100);
        states.release_all(&mut engine).expect("release");
    }

    #[test]
    fn released_state_never_reappears_in_assignments() {
        let mut engine = HostEngine::new();
        let (mut states, batch, mut builder, desc) = stateful_setup(&mut engine, 2, 2);
        let mut srcs = sources(desc, 2, 4);

        states.release(&mut engine, 1).expect("release");
        let FillOutcome::Filled(assignment) = builder
            .fill(&mut engine, &mut srcs, &states, &batch, 2, 1.0)
            .expect("fill")
        else {
            panic!("unexpected end of stream");
        };
        let array = assignment.state_array();
        assert!(array[0].is_some());
        assert!(array[1].is_none());
        states.release_all(&mut engine).expect("release_all");
    }

    #[test]
    fn stateless_streams_may_repeat_within_a_batch() {
        let mut engine = HostEngine::new();
        let desc = bgr_desc(8, 4);
        let fx = engine.create_effect(FX_PASSTHRU).expect("create");
        engine.set_u32(fx, sel::BATCH_SIZE, 4).expect("batch");
        engine.load(fx).expect("load");
        let states = StreamStateSet::stateless(fx, 2);
        let batch = BatchBuffer::allocate(&mut engine, &desc, 4).expect("buffer");
        let mut builder = BatchBuilder::new(&mut engine, desc, 2).expect("builder");
        let mut srcs = sources(desc, 2, 4);

        let FillOutcome::Filled(assignment) = builder
            .fill(&mut engine, &mut srcs, &states, &batch, 4, 1.0)
            .expect("fill")
        else {
            panic!("unexpected end of stream");
        };
        assert_eq!(
            (0..4).map(|s| assignment.stream_of(s).expect("stream")).collect::<Vec<_>>(),
            vec![0, 1, 0, 1]
        );
    }
}
