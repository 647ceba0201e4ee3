use crate::{
    format::ShaderStageFlags,
    handle::{RawBufferHandle, RawDescriptorSetHandle, RawSamplerHandle, RawTextureViewHandle},
    types::TextureLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    Sampler,
    SampledTexture,
    StorageTexture,
    UniformBuffer,
    StorageBuffer,
}

/// descriptor set layout 中的一个 binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStageFlags,
    /// bindless 数组：partially bound + update after bind
    pub bindless: bool,
}

impl DescriptorSetLayoutBinding {
    #[inline]
    pub fn new(binding: u32, ty: DescriptorType, stages: ShaderStageFlags) -> Self {
        Self {
            binding,
            ty,
            count: 1,
            stages,
            bindless: false,
        }
    }

    #[inline]
    pub fn bindless(binding: u32, ty: DescriptorType, count: u32) -> Self {
        Self {
            binding,
            ty,
            count,
            stages: ShaderStageFlags::ALL,
            bindless: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutDesc {
    #[inline]
    pub fn is_bindless(&self) -> bool {
        self.bindings.iter().any(|b| b.bindless)
    }

    #[inline]
    pub fn binding(&self, binding: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorPoolCreateInfo {
    pub max_sets: u32,
    pub pool_sizes: Vec<(DescriptorType, u32)>,
    /// bindless 的 descriptor set 需要从 update-after-bind 的 pool 中分配
    pub update_after_bind: bool,
}

impl DescriptorPoolCreateInfo {
    /// 每帧临时 descriptor set 使用的 pool
    pub fn transient(max_sets: u32) -> Self {
        Self {
            max_sets,
            pool_sizes: vec![
                (DescriptorType::UniformBuffer, max_sets * 4),
                (DescriptorType::StorageBuffer, max_sets * 4),
                (DescriptorType::SampledTexture, max_sets * 4),
                (DescriptorType::StorageTexture, max_sets * 2),
                (DescriptorType::Sampler, max_sets * 2),
            ],
            update_after_bind: false,
        }
    }
}

/// descriptor 写入的资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    Buffer {
        buffer: RawBufferHandle,
        offset: u64,
        range: u64,
    },
    TextureView {
        view: RawTextureViewHandle,
        layout: TextureLayout,
    },
    Sampler(RawSamplerHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    pub set: RawDescriptorSetHandle,
    pub binding: u32,
    pub array_element: u32,
    pub ty: DescriptorType,
    pub resource: DescriptorResource,
}
