//! Graphics and compute pipeline state.
//!
//! Pipelines take precompiled SPIR-V; compiling shaders is the caller's
//! business. Every pipeline shares the device's bindless layout: resources
//! are reached through view indices passed as push constants.

use std::sync::Arc;

use tracing::debug;

use crate::backend::RawPipeline;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::view::CompareOp;

/// SPIR-V magic number.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Largest push constant block every backend supports.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

/// Most color attachments a pipeline may write.
pub const MAX_COLOR_TARGETS: usize = 8;

/// A compiled shader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBytecode {
    words: Vec<u32>,
    entry: String,
}

impl ShaderBytecode {
    /// Wraps SPIR-V words.
    pub fn from_words(words: Vec<u32>, entry: impl Into<String>) -> Self {
        Self {
            words,
            entry: entry.into(),
        }
    }

    /// Parses SPIR-V from raw bytes (little endian).
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderError`] if the length is not a multiple of
    /// four or the magic number is missing.
    pub fn from_bytes(bytes: &[u8], entry: impl Into<String>) -> RhiResult<Self> {
        if bytes.len() % 4 != 0 || bytes.is_empty() {
            return Err(RhiError::ShaderError(format!(
                "SPIR-V length {} is not a nonzero multiple of 4",
                bytes.len()
            )));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words[0] != SPIRV_MAGIC {
            return Err(RhiError::ShaderError(format!(
                "bad SPIR-V magic {:#010x}",
                words[0]
            )));
        }
        Ok(Self::from_words(words, entry))
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[inline]
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: CompareOp::Less,
        }
    }
}

/// Graphics pipeline description.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub name: String,
    pub vertex: ShaderBytecode,
    pub fragment: Option<ShaderBytecode>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub depth: DepthState,
    pub topology: PrimitiveTopology,
    pub cull: CullMode,
    pub fill: FillMode,
    /// Standard alpha blending on every color target.
    pub alpha_blend: bool,
    pub push_constant_size: u32,
}

/// Compute pipeline description.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputePipelineDesc {
    pub name: String,
    pub shader: ShaderBytecode,
    pub push_constant_size: u32,
}

/// Either kind of pipeline description.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDesc),
    Compute(ComputePipelineDesc),
}

/// Bind point of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

impl PipelineDesc {
    pub fn name(&self) -> &str {
        match self {
            PipelineDesc::Graphics(desc) => &desc.name,
            PipelineDesc::Compute(desc) => &desc.name,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            PipelineDesc::Graphics(_) => PipelineKind::Graphics,
            PipelineDesc::Compute(_) => PipelineKind::Compute,
        }
    }

    pub fn push_constant_size(&self) -> u32 {
        match self {
            PipelineDesc::Graphics(desc) => desc.push_constant_size,
            PipelineDesc::Compute(desc) => desc.push_constant_size,
        }
    }

    /// Checks limits every backend shares.
    pub fn validate(&self) -> RhiResult<()> {
        let size = self.push_constant_size();
        if size > MAX_PUSH_CONSTANT_SIZE || size % 4 != 0 {
            return Err(RhiError::PipelineError(format!(
                "'{}': push constant size {} must be a multiple of 4 up to {}",
                self.name(),
                size,
                MAX_PUSH_CONSTANT_SIZE
            )));
        }
        if let PipelineDesc::Graphics(desc) = self {
            if desc.color_formats.len() > MAX_COLOR_TARGETS {
                return Err(RhiError::PipelineError(format!(
                    "'{}': {} color targets, at most {}",
                    desc.name,
                    desc.color_formats.len(),
                    MAX_COLOR_TARGETS
                )));
            }
            if desc
                .color_formats
                .iter()
                .any(|f| f.is_depth() || *f == Format::Unknown)
            {
                return Err(RhiError::PipelineError(format!(
                    "'{}': color targets need concrete color formats",
                    desc.name
                )));
            }
            if let Some(depth) = desc.depth_format
                && !depth.is_depth()
            {
                return Err(RhiError::PipelineError(format!(
                    "'{}': {:?} is not a depth format",
                    desc.name, depth
                )));
            }
            if !desc.color_formats.is_empty() && desc.fragment.is_none() {
                return Err(RhiError::PipelineError(format!(
                    "'{}': color targets without a fragment shader",
                    desc.name
                )));
            }
        }
        Ok(())
    }
}

/// A created pipeline.
pub struct Pipeline {
    device: Arc<Device>,
    raw: RawPipeline,
    kind: PipelineKind,
    name: String,
    push_constant_size: u32,
}

impl Pipeline {
    /// Creates a pipeline. Prefer [`Device::create_pipeline`].
    pub fn new(device: &Arc<Device>, desc: &PipelineDesc) -> RhiResult<Arc<Self>> {
        desc.validate()?;
        let raw = device.backend().create_pipeline(desc)?;
        debug!("Created {:?} pipeline '{}'", desc.kind(), desc.name());

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            raw,
            kind: desc.kind(),
            name: desc.name().to_string(),
            push_constant_size: desc.push_constant_size(),
        }))
    }

    #[inline]
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    #[inline]
    pub fn raw(&self) -> RawPipeline {
        self.raw
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.backend().destroy_pipeline(self.raw);
        debug!("Destroyed pipeline '{}'", self.name);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("push_constant_size", &self.push_constant_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv() -> ShaderBytecode {
        ShaderBytecode::from_words(vec![SPIRV_MAGIC, 0x0001_0600, 0, 1, 0], "main")
    }

    fn graphics() -> GraphicsPipelineDesc {
        GraphicsPipelineDesc {
            name: "forward".into(),
            vertex: spirv(),
            fragment: Some(spirv()),
            color_formats: vec![Format::Rgba16Float],
            depth_format: Some(Format::D32Float),
            depth: DepthState::default(),
            topology: PrimitiveTopology::TriangleList,
            cull: CullMode::Back,
            fill: FillMode::Solid,
            alpha_blend: false,
            push_constant_size: 64,
        }
    }

    #[test]
    fn test_from_bytes() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        let shader = ShaderBytecode::from_bytes(&bytes, "main").unwrap();
        assert_eq!(shader.words(), &[SPIRV_MAGIC, 0]);

        assert!(ShaderBytecode::from_bytes(&[1, 2, 3], "main").is_err());
        assert!(ShaderBytecode::from_bytes(&[0; 8], "main").is_err());
    }

    #[test]
    fn test_validate_graphics() {
        assert!(PipelineDesc::Graphics(graphics()).validate().is_ok());

        let mut bad_depth = graphics();
        bad_depth.depth_format = Some(Format::Rgba8Unorm);
        assert!(PipelineDesc::Graphics(bad_depth).validate().is_err());

        let mut no_fragment = graphics();
        no_fragment.fragment = None;
        assert!(PipelineDesc::Graphics(no_fragment).validate().is_err());

        let mut too_many = graphics();
        too_many.color_formats = vec![Format::Rgba8Unorm; 9];
        assert!(PipelineDesc::Graphics(too_many).validate().is_err());
    }

    #[test]
    fn test_validate_push_constants() {
        let compute = |size| {
            PipelineDesc::Compute(ComputePipelineDesc {
                name: "cull".into(),
                shader: spirv(),
                push_constant_size: size,
            })
        };
        assert!(compute(128).validate().is_ok());
        assert!(compute(132).validate().is_err());
        assert!(compute(6).validate().is_err());
    }
}
