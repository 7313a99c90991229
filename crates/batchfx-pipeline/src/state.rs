//! Per-stream recurrent state lifecycle.
//!
//! Each input stream owns exactly one opaque state handle, allocated against
//! the effect right after load (state shape is effect-specific and only
//! known post-load) and released exactly once before the effect is
//! destroyed.  Destroying the effect with state still live is tolerated
//! (the engine reclaims it) but logged as the degraded path.

use tracing::warn;

use batchfx_core::engine::{EffectId, FxEngine, StateHandle};
use batchfx_core::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Allocated(StateHandle),
    Released,
}

/// One recurrent-state handle per stream, tracked through
/// `allocated → released`.
#[derive(Debug)]
pub struct StreamStateSet {
    effect: EffectId,
    slots: Vec<SlotState>,
}

impl StreamStateSet {
    /// Allocate one state per stream for a loaded effect.
    ///
    /// On a mid-way allocation failure, everything already allocated is
    /// released before the error is returned.
    pub fn allocate(
        engine: &mut dyn FxEngine,
        effect: EffectId,
        num_streams: usize,
    ) -> Result<Self> {
        if num_streams == 0 {
            return Err(Error::Parameter("at least one stream is required".into()));
        }
        let mut slots = Vec::with_capacity(num_streams);
        for _ in 0..num_streams {
            match engine.alloc_state(effect) {
                Ok(handle) => slots.push(SlotState::Allocated(handle)),
                Err(e) => {
                    for slot in &slots {
                        if let SlotState::Allocated(h) = slot {
                            let _ = engine.dealloc_state(effect, *h);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { effect, slots })
    }

    /// A state set for stateless effects: every lookup yields `None`.
    pub fn stateless(effect: EffectId, num_streams: usize) -> Self {
        Self {
            effect,
            slots: vec![SlotState::Released; num_streams],
        }
    }

    /// The effect these states were created against.
    pub fn effect(&self) -> EffectId {
        self.effect
    }

    /// Number of streams tracked (live or released).
    pub fn num_streams(&self) -> usize {
        self.slots.len()
    }

    /// Number of still-allocated handles.  Equals the number of live
    /// streams during steady-state processing.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotState::Allocated(_)))
            .count()
    }

    /// The live handle for `stream`, or `None` if it was already released
    /// (or the set is stateless).
    pub fn handle(&self, stream: usize) -> Result<Option<StateHandle>> {
        match self.slots.get(stream) {
            Some(SlotState::Allocated(h)) => Ok(Some(*h)),
            Some(SlotState::Released) => Ok(None),
            None => Err(Error::Parameter(format!(
                "stream {stream} out of range for {} streams",
                self.slots.len()
            ))),
        }
    }

    /// Release `stream`'s state.  Exactly once: releasing an already
    /// released stream is a caller bug.
    pub fn release(&mut self, engine: &mut dyn FxEngine, stream: usize) -> Result<()> {
        let num_streams = self.slots.len();
        let slot = self.slots.get_mut(stream).ok_or_else(|| {
            Error::Parameter(format!(
                "stream {stream} out of range for {num_streams} streams"
            ))
        })?;
        match std::mem::replace(slot, SlotState::Released) {
            SlotState::Allocated(handle) => engine.dealloc_state(self.effect, handle),
            SlotState::Released => Err(Error::Parameter(format!(
                "stream {stream} state was already released"
            ))),
        }
    }

    /// Release every remaining handle.  Called before the owning effect is
    /// destroyed; idempotent.
    pub fn release_all(&mut self, engine: &mut dyn FxEngine) -> Result<()> {
        for slot in &mut self.slots {
            if let SlotState::Allocated(handle) = std::mem::replace(slot, SlotState::Released) {
                engine.dealloc_state(self.effect, handle)?;
            }
        }
        Ok(())
    }
}

impl Drop for StreamStateSet {
    fn drop(&mut self) {
        let live = self.live_count();
        if live > 0 {
            // The engine reclaims these when the effect is destroyed.
            warn!(
                effect = self.effect.0,
                live, "stream state set dropped without release_all"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchfx_core::engine::sel;
    use batchfx_core::host::{HostEngine, FX_PASSTHRU};

    fn loaded_effect(engine: &mut HostEngine) -> EffectId {
        let fx = engine.create_effect(FX_PASSTHRU).expect("create");
        engine.set_u32(fx, sel::BATCH_SIZE, 3).expect("batch");
        engine.load(fx).expect("load");
        fx
    }

    #[test]
    fn one_state_per_stream() {
        let mut engine = HostEngine::new();
        let fx = loaded_effect(&mut engine);
        let mut set = StreamStateSet::allocate(&mut engine, fx, 3).expect("allocate");
        assert_eq!(set.live_count(), 3);

        let handles: Vec<_> = (0..3).map(|i| set.handle(i).expect("handle")).collect();
        assert!(handles.iter().all(|h| h.is_some()));
        // All distinct.
        assert_ne!(handles[0], handles[1]);
        assert_ne!(handles[1], handles[2]);
        set.release_all(&mut engine).expect("release");
    }

    #[test]
    fn release_is_exactly_once() {
        let mut engine = HostEngine::new();
        let fx = loaded_effect(&mut engine);
        let mut set = StreamStateSet::allocate(&mut engine, fx, 2).expect("allocate");

        set.release(&mut engine, 1).expect("first release");
        assert_eq!(set.live_count(), 1);
        assert_eq!(set.handle(1).expect("handle"), None);
        assert_eq!(set.release(&mut engine, 1).unwrap_err().error_code(), 100);

        set.release_all(&mut engine).expect("release_all");
        assert_eq!(set.live_count(), 0);
        // release_all is idempotent.
        set.release_all(&mut engine).expect("release_all again");
    }

    #[test]
    fn out_of_range_release_leaves_the_set_intact() {
        let mut engine = HostEngine::new();
        let fx = loaded_effect(&mut engine);
        let mut set = StreamStateSet::allocate(&mut engine, fx, 2).expect("allocate");

        let err = set.release(&mut engine, 5).unwrap_err();
        assert_eq!(err.error_code(), 100);
        assert_eq!(set.live_count(), 2);
        set.release_all(&mut engine).expect("release_all");
    }

    #[test]
    fn stateless_set_yields_no_handles() {
        let mut engine = HostEngine::new();
        let fx = loaded_effect(&mut engine);
        let set = StreamStateSet::stateless(fx, 4);
        assert_eq!(set.live_count(), 0);
        assert_eq!(set.handle(2).expect("handle"), None);
    }
}
