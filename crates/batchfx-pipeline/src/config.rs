//! Immutable pipeline configuration.
//!
//! Built once at startup (usually from CLI flags) and passed by reference
//! into pipeline constructors.  Nothing in the pipeline mutates it.

use serde::{Deserialize, Serialize};

use batchfx_core::image::{ComponentType, Layout, MemSpace, PixelFormat};
use batchfx_core::{Error, ImageDesc, Result};

/// Configuration for one batched single-effect pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Effect selector passed to the engine (e.g. `"passthru"`).
    pub effect: String,
    /// Directory containing the effect's model files, if it needs any.
    #[serde(default)]
    pub model_dir: Option<String>,
    /// Batch size requested before load.  The loaded variant's actual
    /// maximum is re-queried and governs from then on.
    pub batch_size: u32,
    /// Effect strength in `[0, 1]`, bound per invocation when set.
    #[serde(default)]
    pub strength: Option<f32>,
    /// Effect-specific integer mode.
    #[serde(default)]
    pub mode: Option<u32>,
    /// Frame geometry every source must match.
    pub frame: FrameGeometry,
    /// Format/layout of the device batch buffers the effect runs over, when
    /// it differs from the frame format (e.g. planar float for a model that
    /// consumes normalized channels).  Width and height must match `frame`.
    #[serde(default)]
    pub effect_frame: Option<FrameGeometry>,
    /// Whether the effect carries per-stream recurrent state.
    #[serde(default = "default_true")]
    pub stateful: bool,
    /// Sample scale applied packing frames into the input batch
    /// (e.g. `1/255` when the effect consumes normalized floats).
    #[serde(default = "unit_scale")]
    pub input_scale: f32,
    /// Sample scale applied unpacking the output batch.
    #[serde(default = "unit_scale")]
    pub output_scale: f32,
}

fn unit_scale() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Geometry and format of the frames the pipeline exchanges with sources
/// and sinks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub component: ComponentType,
    pub layout: Layout,
}

impl FrameGeometry {
    /// Host-side descriptor for one frame, tightly packed.
    pub fn host_desc(&self) -> Result<ImageDesc> {
        ImageDesc::new(
            self.width,
            self.height,
            self.format,
            self.component,
            self.layout,
            MemSpace::Host,
            1,
        )
    }

    /// Device-side descriptor for one image of a batch buffer.
    pub fn device_desc(&self) -> Result<ImageDesc> {
        ImageDesc::new(
            self.width,
            self.height,
            self.format,
            self.component,
            self.layout,
            MemSpace::Device,
            1,
        )
    }

    /// Same geometry with a different format, layout, and component type.
    pub fn with_format(
        &self,
        format: PixelFormat,
        component: ComponentType,
        layout: Layout,
    ) -> Self {
        Self {
            width: self.width,
            height: self.height,
            format,
            component,
            layout,
        }
    }
}

impl PipelineConfig {
    /// Validate the parts that do not need an engine.
    pub fn validate(&self) -> Result<()> {
        if self.effect.is_empty() {
            return Err(Error::Parameter("effect selector is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Parameter("batch_size must be at least 1".into()));
        }
        if let Some(s) = self.strength {
            if !(0.0..=1.0).contains(&s) {
                return Err(Error::Parameter(format!(
                    "strength must be in [0, 1], got {s}"
                )));
            }
        }
        self.frame.host_desc()?;
        if let Some(effect_frame) = &self.effect_frame {
            if effect_frame.width != self.frame.width || effect_frame.height != self.frame.height {
                return Err(Error::Resolution(format!(
                    "effect buffers are {}x{} but frames are {}x{}",
                    effect_frame.width, effect_frame.height, self.frame.width, self.frame.height
                )));
            }
            effect_frame.device_desc()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PipelineConfig {
        PipelineConfig {
            effect: "passthru".into(),
            model_dir: None,
            batch_size: 2,
            strength: None,
            mode: None,
            frame: FrameGeometry {
                width: 64,
                height: 64,
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
    fn effect_frame_must_match_geometry() {
        let mut cfg = base();
        cfg.effect_frame = Some(
            cfg.frame
                .with_format(PixelFormat::Bgr, ComponentType::F32, Layout::Planar),
        );
        assert!(cfg.validate().is_ok());
        cfg.effect_frame.as_mut().expect("set").width = 32;
        assert_eq!(cfg.validate().unwrap_err().error_code(), 103);
    }

    #[test]
    fn validates_strength_range() {
        let mut cfg = base();
        assert!(cfg.validate().is_ok());
        cfg.strength = Some(1.5);
        assert_eq!(cfg.validate().unwrap_err().error_code(), 100);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = base();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: PipelineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.effect, cfg.effect);
        assert_eq!(back.batch_size, cfg.batch_size);
        assert_eq!(back.frame.width, cfg.frame.width);
    }
}
