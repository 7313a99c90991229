//! Pixel buffer descriptors and pixel format contracts.
//!
//! # Ownership model
//!
//! [`ImageDesc`] is a plain value: geometry, format, and row stride.  It
//! never owns pixel memory.  Owning allocations live behind the engine seam
//! ([`crate::engine::FxEngine`]) and are addressed by [`crate::engine::BufferId`];
//! a descriptor plus a byte offset into such a buffer forms a zero-copy view
//! ([`crate::engine::ImageView`]).
//!
//! # Invariants
//!
//! 1. `pitch` ≥ `width × row_bytes_per_pixel`, rounded up to the declared
//!    alignment.
//! 2. Every byte-size formula here is used for offset arithmetic between
//!    batch slots.  Unrecognized format/layout combinations are rejected at
//!    construction; the arithmetic functions never guess.
//! 3. Chroma-subsampled planar formats have their vertical plane multiplier
//!    fixed by the pixel format: 4:2:0 → ×3/2, 4:2:2 → ×2, 4:4:4 → ×3
//!    relative to one luma plane.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Channel semantics of a pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Single-channel luma.
    Y,
    /// Single-channel alpha.
    A,
    /// Red, green, blue.
    Rgb,
    /// Blue, green, red.
    Bgr,
    /// Red, green, blue, alpha.
    Rgba,
    /// Blue, green, red, alpha.
    Bgra,
    /// Full-resolution chroma, planar only.
    Yuv444,
    /// Horizontally sub-sampled chroma, planar only.
    Yuv422,
    /// Horizontally and vertically sub-sampled chroma, planar only.
    Yuv420,
}

impl PixelFormat {
    /// Number of channels the format carries.
    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            Self::Y | Self::A => 1,
            Self::Rgb | Self::Bgr | Self::Yuv444 | Self::Yuv422 | Self::Yuv420 => 3,
            Self::Rgba | Self::Bgra => 4,
        }
    }

    /// Whether the format is one of the chroma-carrying YUV family.
    #[inline]
    pub const fn is_yuv(self) -> bool {
        matches!(self, Self::Yuv444 | Self::Yuv422 | Self::Yuv420)
    }

    /// Channel position of R, G, B, A within a pixel (chunky) or the plane
    /// index of each channel (planar).  `None` for YUV formats, whose
    /// channels are not RGB-addressable.
    pub const fn component_offsets(self) -> Option<ComponentOffsets> {
        match self {
            Self::Y => Some(ComponentOffsets {
                r: Some(0),
                g: Some(0),
                b: Some(0),
                a: None,
            }),
            Self::A => Some(ComponentOffsets {
                r: None,
                g: None,
                b: None,
                a: Some(0),
            }),
            Self::Rgb => Some(ComponentOffsets {
                r: Some(0),
                g: Some(1),
                b: Some(2),
                a: None,
            }),
            Self::Bgr => Some(ComponentOffsets {
                r: Some(2),
                g: Some(1),
                b: Some(0),
                a: None,
            }),
            Self::Rgba => Some(ComponentOffsets {
                r: Some(0),
                g: Some(1),
                b: Some(2),
                a: Some(3),
            }),
            Self::Bgra => Some(ComponentOffsets {
                r: Some(2),
                g: Some(1),
                b: Some(0),
                a: Some(3),
            }),
            Self::Yuv444 | Self::Yuv422 | Self::Yuv420 => None,
        }
    }
}

/// Per-channel positions within a pixel or plane stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentOffsets {
    pub r: Option<usize>,
    pub g: Option<usize>,
    pub b: Option<usize>,
    pub a: Option<usize>,
}

/// Scalar type of each channel sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// 8-bit unsigned integer, nominal range `[0, 255]`.
    U8,
    /// 32-bit float, nominal range `[0.0, 1.0]` after normalization.
    F32,
}

impl ComponentType {
    /// Size of one sample in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F32 => 4,
        }
    }
}

/// Arrangement of channel samples in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Channels interleaved per pixel: `[B G R B G R ...]`.
    Chunky,
    /// One plane per channel, stacked vertically.  For the YUV family the
    /// chroma planes follow the format's sub-sampling geometry.
    Planar,
}

/// Where a buffer's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemSpace {
    /// Pageable host memory.
    Host,
    /// Page-locked host memory (faster accelerator transfers).
    HostPinned,
    /// Accelerator device memory.
    Device,
}

// ─── Descriptor ──────────────────────────────────────────────────────────────

/// Default row alignment when the caller passes `alignment == 0`.
pub const DEFAULT_ALIGNMENT: usize = 4;

/// Geometry, format, and stride of one rectangular pixel buffer.
///
/// A plain value type.  Construct with [`ImageDesc::new`] (which computes
/// the pitch) or [`ImageDesc::with_pitch`] (to wrap externally laid-out
/// memory).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDesc {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels of the described region.  For a batch buffer this is
    /// `image_height × batch_size`.
    pub height: u32,
    /// Channel semantics.
    pub format: PixelFormat,
    /// Scalar type of each sample.
    pub component: ComponentType,
    /// Memory arrangement.
    pub layout: Layout,
    /// Memory space of the backing buffer.
    pub space: MemSpace,
    /// Row stride in bytes.  Covers one chunky row, or one plane row for
    /// planar layouts.
    pub pitch: usize,
}

impl ImageDesc {
    /// Build a descriptor, computing the pitch from width and alignment.
    ///
    /// `alignment` must be 0 (meaning [`DEFAULT_ALIGNMENT`]) or a power of
    /// two.  Returns [`Error::PixelFormat`] for format/component/layout
    /// combinations the arithmetic does not support, and
    /// [`Error::Resolution`] for geometry the format cannot represent
    /// (odd dimensions with sub-sampled chroma).
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        component: ComponentType,
        layout: Layout,
        space: MemSpace,
        alignment: usize,
    ) -> Result<Self> {
        let align = match alignment {
            0 => DEFAULT_ALIGNMENT,
            a if a.is_power_of_two() => a,
            a => {
                return Err(Error::Parameter(format!(
                    "alignment must be 0 or a power of 2, got {a}"
                )));
            }
        };
        validate_combination(format, component, layout)?;
        validate_geometry(width, height, format)?;
        let row = width as usize * row_bytes_per_pixel(format, component, layout);
        let pitch = row.div_ceil(align) * align;
        Ok(Self {
            width,
            height,
            format,
            component,
            layout,
            space,
            pitch,
        })
    }

    /// Build a descriptor around an externally chosen pitch.
    ///
    /// The pitch must still cover one unaligned row.
    pub fn with_pitch(
        width: u32,
        height: u32,
        format: PixelFormat,
        component: ComponentType,
        layout: Layout,
        space: MemSpace,
        pitch: usize,
    ) -> Result<Self> {
        validate_combination(format, component, layout)?;
        validate_geometry(width, height, format)?;
        let row = width as usize * row_bytes_per_pixel(format, component, layout);
        if pitch < row {
            return Err(Error::Parameter(format!(
                "pitch {pitch} is smaller than one row of {row} bytes"
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            component,
            layout,
            space,
            pitch,
        })
    }

    /// Byte span of one row, regardless of layout.
    #[inline]
    pub fn bytes_per_row(&self) -> usize {
        self.pitch
    }

    /// Bytes per pixel within one pitched row: full pixel size for chunky,
    /// one sample for planar.
    #[inline]
    pub fn row_bytes_per_pixel(&self) -> usize {
        row_bytes_per_pixel(self.format, self.component, self.layout)
    }

    /// Total byte size of the described buffer.
    ///
    /// `pitch × height` for chunky; multiplied by the component count for
    /// fully planar; ×2 for 4:2:2; `pitch × height × 3 / 2` (truncating, in
    /// that order) for 4:2:0.  The truncation order is load-bearing: this
    /// value is used for pointer arithmetic between batch slots and must
    /// match the plane-offset computation exactly.
    pub fn total_bytes(&self) -> Result<usize> {
        let (num, den) = self.plane_multiplier()?;
        Ok(self.pitch * self.height as usize * num / den)
    }

    /// Number of luma-equivalent rows each image of `self.height` occupies
    /// in a vertically stacked buffer.  Slot `n` of a batch starts at row
    /// `n × slot_rows()`.
    ///
    /// Fails with [`Error::Resolution`] when the row count is fractional
    /// (4:2:0 with odd height), because a stacked buffer would then have no
    /// byte-exact slot boundary.
    pub fn slot_rows(&self) -> Result<usize> {
        let (num, den) = self.plane_multiplier()?;
        let scaled = self.height as usize * num;
        if scaled % den != 0 {
            return Err(Error::Resolution(format!(
                "height {} is not stackable for {:?} (fractional chroma rows)",
                self.height, self.format
            )));
        }
        Ok(scaled / den)
    }

    /// Vertical plane multiplier as a `(numerator, denominator)` rational:
    /// 1 for chunky, the component count for fully planar RGB, and the
    /// format-fixed ratio for sub-sampled chroma.
    pub fn plane_multiplier(&self) -> Result<(usize, usize)> {
        match (self.layout, self.format) {
            (Layout::Chunky, f) if !f.is_yuv() => Ok((1, 1)),
            (Layout::Planar, PixelFormat::Yuv444) => Ok((3, 1)),
            (Layout::Planar, PixelFormat::Yuv422) => Ok((2, 1)),
            (Layout::Planar, PixelFormat::Yuv420) => Ok((3, 2)),
            (Layout::Planar, f) if !f.is_yuv() => Ok((f.channels(), 1)),
            _ => Err(Error::PixelFormat {
                format: self.format,
                component: self.component,
                layout: self.layout,
            }),
        }
    }

    /// The same descriptor with a different height (used to carve per-image
    /// views out of a batch descriptor).
    #[inline]
    pub(crate) fn with_height(&self, height: u32) -> Self {
        Self { height, ..*self }
    }

    /// True when `other` describes the same pixel geometry (everything but
    /// memory space and pitch).
    pub fn same_shape(&self, other: &ImageDesc) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.format == other.format
            && self.component == other.component
            && self.layout == other.layout
    }
}

fn row_bytes_per_pixel(format: PixelFormat, component: ComponentType, layout: Layout) -> usize {
    match layout {
        Layout::Chunky => format.channels() * component.size(),
        Layout::Planar => component.size(),
    }
}

fn validate_combination(
    format: PixelFormat,
    component: ComponentType,
    layout: Layout,
) -> Result<()> {
    let supported = match (layout, format) {
        // YUV is planar-only, 8-bit only.
        (Layout::Chunky, f) if f.is_yuv() => false,
        (Layout::Planar, f) if f.is_yuv() => component == ComponentType::U8,
        // Planar RGBA would need a fourth plane transfer path nothing uses.
        (Layout::Planar, PixelFormat::Rgba | PixelFormat::Bgra) => false,
        _ => true,
    };
    if supported {
        Ok(())
    } else {
        Err(Error::PixelFormat {
            format,
            component,
            layout,
        })
    }
}

fn validate_geometry(width: u32, height: u32, format: PixelFormat) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::Resolution(format!("empty image {width}x{height}")));
    }
    match format {
        PixelFormat::Yuv422 | PixelFormat::Yuv420 if width % 2 != 0 => Err(Error::Resolution(
            format!("{format:?} requires even width, got {width}"),
        )),
        _ => Ok(()),
    }
}
