//! Layout-aware batched image buffers and the opaque effect-engine seam.
//!
//! The crate is organized leaves-first:
//!
//! - [`image`]: pixel buffer descriptors and the byte-exact plane/stride
//!   arithmetic everything else depends on.
//! - [`batch`]: stacking N images into one contiguous buffer and carving
//!   zero-copy slot views back out.
//! - [`engine`]: the single trait seam over an accelerator effect SDK.
//! - [`host`]: the heap-backed reference engine used by tests and as the
//!   no-accelerator fallback.
//! - [`error`]: the flat status namespace shared by every layer.

pub mod batch;
pub mod engine;
pub mod error;
pub mod host;
pub mod image;

pub use batch::BatchBuffer;
pub use engine::{BufferId, EffectId, FxEngine, ImageView, StateHandle};
pub use error::{Error, Result};
pub use image::{ComponentType, ImageDesc, Layout, MemSpace, PixelFormat};
