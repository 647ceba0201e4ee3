use std::sync::Arc;

use ze_device::{BufferHandle, CommandList, DescriptorIndexHandle, Device, DeviceError, TextureViewHandle};
use ze_gfx::DeviceResourceType;

use crate::{
    error::ShaderError,
    shader::{ShaderMap, ShaderParameter, ShaderPermutation},
};

/// 一个 permutation 加上一组参数值
///
/// 参数是资源的 bindless 索引，写在本地的 push constant 缓冲中，`bind` 时一次性推送。
pub struct ShaderInstance {
    permutation: Arc<ShaderPermutation>,
    shader_map: Arc<ShaderMap>,
    push_constants: Vec<u8>,
}

// new & init
impl ShaderInstance {
    /// 等待 permutation 编译完成
    pub fn new(device: &Device, permutation: Arc<ShaderPermutation>) -> Result<Self, ShaderError> {
        let shader_map = permutation.get_shader_map(device)?;
        let push_constants = vec![0; shader_map.push_constant_size as usize];
        Ok(Self {
            permutation,
            shader_map,
            push_constants,
        })
    }
}

// getters
impl ShaderInstance {
    #[inline]
    pub fn permutation(&self) -> &Arc<ShaderPermutation> {
        &self.permutation
    }

    #[inline]
    pub fn shader_map(&self) -> &ShaderMap {
        &self.shader_map
    }

    #[inline]
    pub fn push_constants(&self) -> &[u8] {
        &self.push_constants
    }
}

// tools
impl ShaderInstance {
    fn parameter(&self, name: &str) -> Result<ShaderParameter, ShaderError> {
        match self.shader_map.parameters.get(name) {
            Some(parameter) => Ok(*parameter),
            None => {
                log::warn!("shader {} has no parameter named {}", self.permutation.name(), name);
                Err(ShaderError::UnknownParameter { name: name.to_string() })
            }
        }
    }

    /// 把 bindless 索引写到参数的偏移处
    pub fn set_parameter(&mut self, name: &str, index: DescriptorIndexHandle) -> Result<(), ShaderError> {
        let parameter = self.parameter(name)?;
        if parameter.is_uav != index.is_uav {
            log::warn!(
                "shader {} parameter {} expects is_uav = {}, got {:?}",
                self.permutation.name(),
                name,
                parameter.is_uav,
                index
            );
        }

        let offset = parameter.offset as usize;
        self.push_constants[offset..offset + size_of::<u32>()].copy_from_slice(bytemuck::bytes_of(&index.index));
        Ok(())
    }

    pub fn set_texture(&mut self, device: &Device, name: &str, view: TextureViewHandle) -> Result<(), ShaderError> {
        let parameter = self.parameter(name)?;
        let index = device
            .texture_view_descriptor_index(view, parameter.is_uav)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::TextureView))?;
        self.set_parameter(name, index)
    }

    pub fn set_buffer(&mut self, device: &Device, name: &str, buffer: BufferHandle) -> Result<(), ShaderError> {
        let parameter = self.parameter(name)?;
        let index = device
            .buffer_descriptor_index(buffer, parameter.is_uav)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?;
        self.set_parameter(name, index)
    }

    /// 绑定 pipeline layout，推送参数，绑定每个 stage 的 shader
    pub fn bind(&self, device: &Device, cmd: &mut CommandList) -> Result<(), ShaderError> {
        device.cmd_bind_pipeline_layout(cmd, self.shader_map.pipeline_layout)?;
        if !self.push_constants.is_empty() {
            device.cmd_push_constants(cmd, self.shader_map.push_constant_stages, 0, &self.push_constants)?;
        }
        for stage in self.shader_map.stages.values() {
            device.cmd_bind_shader(cmd, stage.shader, &stage.entry)?;
        }
        Ok(())
    }
}
