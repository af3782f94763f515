use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use sortie_core::device::{
    DescriptorSetLayoutId, DeviceResult, GpuDevice, GraphicsPipelineDesc, PipelineId,
    ShaderModuleId,
};

/// Vertex shader shared by every fullscreen pass.
pub const FULLSCREEN_VERTEX_SHADER: &str = "shaders/post/fullscreen.vert.spv";

#[derive(Clone, Copy, Debug)]
pub struct FullscreenPipelineDesc<'a> {
    pub label: &'static str,
    pub fragment_shader: &'a str,
    pub set_layouts: &'a [DescriptorSetLayoutId],
    pub push_constant_size: u32,
    pub output_format: wgpu::TextureFormat,
    pub additive_blend: bool,
}

/// Builds fullscreen-triangle pipelines for post-process effects.
///
/// The vertex shader is loaded once; fragment shaders are cached by path.
/// Every pipeline created here is destroyed by [`Self::shutdown`] unless it
/// was destroyed earlier through [`Self::destroy_pipeline`].
pub struct PipelineFactory {
    device: Arc<dyn GpuDevice>,
    vertex: Option<ShaderModuleId>,
    fragments: FxHashMap<String, ShaderModuleId>,
    pipelines: Vec<PipelineId>,
}

impl PipelineFactory {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            vertex: None,
            fragments: FxHashMap::default(),
            pipelines: Vec::new(),
        }
    }

    fn vertex_module(&mut self) -> DeviceResult<ShaderModuleId> {
        if let Some(module) = self.vertex {
            return Ok(module);
        }
        let module = self.device.load_shader_binary(FULLSCREEN_VERTEX_SHADER)?;
        self.vertex = Some(module);
        Ok(module)
    }

    fn fragment_module(&mut self, path: &str) -> DeviceResult<ShaderModuleId> {
        if let Some(&module) = self.fragments.get(path) {
            return Ok(module);
        }
        let module = self.device.load_shader_binary(path)?;
        self.fragments.insert(path.to_owned(), module);
        Ok(module)
    }

    pub fn create_pipeline(&mut self, desc: &FullscreenPipelineDesc<'_>) -> DeviceResult<PipelineId> {
        let vertex = self.vertex_module()?;
        let fragment = self.fragment_module(desc.fragment_shader)?;

        let pipeline = self.device.create_graphics_pipeline(&GraphicsPipelineDesc {
            label: desc.label,
            vertex,
            fragment,
            set_layouts: SmallVec::from_slice(desc.set_layouts),
            push_constant_size: desc.push_constant_size,
            color_format: desc.output_format,
            additive_blend: desc.additive_blend,
        })?;
        self.pipelines.push(pipeline);
        log::debug!("Created post pipeline '{}' ({:?})", desc.label, desc.output_format);
        Ok(pipeline)
    }

    pub fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(pos) = self.pipelines.iter().position(|&p| p == pipeline) {
            self.pipelines.swap_remove(pos);
            self.device.destroy_pipeline(pipeline);
        }
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    #[must_use]
    pub fn shader_count(&self) -> usize {
        self.fragments.len() + usize::from(self.vertex.is_some())
    }

    /// Destroys all pipelines and shader modules.
    pub fn shutdown(&mut self) {
        for pipeline in self.pipelines.drain(..) {
            self.device.destroy_pipeline(pipeline);
        }
        for (_, module) in self.fragments.drain() {
            self.device.destroy_shader_module(module);
        }
        if let Some(module) = self.vertex.take() {
            self.device.destroy_shader_module(module);
        }
    }
}

impl Drop for PipelineFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
