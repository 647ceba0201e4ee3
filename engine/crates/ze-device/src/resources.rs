//! Device 层的 create info 以及资源池中存放的条目

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use ze_gfx::{
    Format, ShaderStage, SwapchainDesc,
    create_info::{PipelineLayoutCreateInfo, TextureCreateInfo as GfxTextureCreateInfo, TextureSubresourceRange},
    descriptor::{DescriptorSetLayoutDesc, PushConstantRange},
    handle::*,
    types::*,
};

use crate::{
    bindless::DescriptorIndexHandle,
    handles::{SwapchainHandle, TextureHandle, TextureViewHandle},
};

/// buffer 的创建参数
///
/// `initial_data` 非空且内存不可被 CPU 访问时，Device 会通过 staging buffer 上传
#[derive(Debug, Clone, Default)]
pub struct BufferCreateInfo<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_usage: MemoryUsage,
    pub initial_data: &'a [u8],
    pub debug_name: &'a str,
}

impl<'a> BufferCreateInfo<'a> {
    pub fn new(size: u64, usage: BufferUsage, memory_usage: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            memory_usage,
            initial_data: &[],
            debug_name: "",
        }
    }

    #[inline]
    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.initial_data = data;
        self
    }

    #[inline]
    pub fn with_name(mut self, name: &'a str) -> Self {
        self.debug_name = name;
        self
    }
}

/// texture 的创建参数
#[derive(Debug, Clone)]
pub struct TextureCreateInfo<'a> {
    pub info: GfxTextureCreateInfo,
    /// 紧密排列的第 0 级 mip 数据
    pub initial_data: &'a [u8],
}

impl<'a> TextureCreateInfo<'a> {
    pub fn new_2d(format: Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            info: GfxTextureCreateInfo::new_2d(format, width, height, usage),
            initial_data: &[],
        }
    }

    #[inline]
    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.initial_data = data;
        self
    }

    #[inline]
    pub fn with_name(mut self, name: &str) -> Self {
        self.info.debug_name = name.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureViewCreateInfo {
    pub texture: TextureHandle,
    pub view_type: TextureViewType,
    /// None 表示沿用 texture 的格式
    pub format: Option<Format>,
    pub range: TextureSubresourceRange,
}

impl TextureViewCreateInfo {
    pub fn whole_2d(texture: TextureHandle) -> Self {
        Self {
            texture,
            view_type: TextureViewType::View2D,
            format: None,
            range: TextureSubresourceRange::default(),
        }
    }
}

/// pipeline layout 的描述
///
/// set 0 固定为 bindless set，`sets` 中的第 i 项对应 set i + 1
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PipelineLayoutDesc {
    pub sets: Vec<DescriptorSetLayoutDesc>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainCreateInfo {
    pub display_handle: RawDisplayHandle,
    pub window_handle: RawWindowHandle,
    pub width: u32,
    pub height: u32,
    pub preferred_format: Format,
    pub vsync: bool,
    pub old_swapchain: Option<SwapchainHandle>,
}

// 池中的条目

#[derive(Debug, Clone)]
pub(crate) struct BufferEntry {
    pub raw: RawBufferHandle,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_usage: MemoryUsage,
    pub srv: Option<DescriptorIndexHandle>,
    pub uav: Option<DescriptorIndexHandle>,
    pub mapped: bool,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TextureEntry {
    pub raw: RawTextureHandle,
    pub info: GfxTextureCreateInfo,
    /// 交换链的图像由交换链销毁
    pub swapchain_owned: bool,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TextureViewEntry {
    pub raw: RawTextureViewHandle,
    pub texture: TextureHandle,
    pub format: Format,
    pub view_type: TextureViewType,
    pub srv: Option<DescriptorIndexHandle>,
    pub uav: Option<DescriptorIndexHandle>,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SamplerEntry {
    pub raw: RawSamplerHandle,
    pub srv: Option<DescriptorIndexHandle>,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ShaderEntry {
    pub raw: RawShaderHandle,
    pub stage: ShaderStage,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineLayoutEntry {
    pub raw: RawPipelineLayoutHandle,
    /// 包含 set 0 的完整描述
    pub info: PipelineLayoutCreateInfo,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SwapchainEntry {
    pub raw: RawSwapchainHandle,
    pub desc: SwapchainDesc,
    pub textures: Vec<TextureHandle>,
    pub views: Vec<TextureViewHandle>,
    pub retired: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SyncEntry<H> {
    pub raw: H,
    pub retired: bool,
}

/// 资源池条目共有的退休标记
///
/// 被 `destroy_*` 标记后条目仍留在池中，句柄依然有效，但不能再被用于创建新的引用
pub(crate) trait PoolEntry {
    fn is_retired(&self) -> bool;
    fn set_retired(&mut self);
}

macro_rules! impl_pool_entry {
    ($($ty:ty),* $(,)?) => {
        $(
            impl PoolEntry for $ty {
                #[inline]
                fn is_retired(&self) -> bool {
                    self.retired
                }
                #[inline]
                fn set_retired(&mut self) {
                    self.retired = true;
                }
            }
        )*
    };
}

impl_pool_entry!(
    BufferEntry,
    TextureEntry,
    TextureViewEntry,
    SamplerEntry,
    ShaderEntry,
    PipelineLayoutEntry,
    SwapchainEntry,
);

impl<H> PoolEntry for SyncEntry<H> {
    #[inline]
    fn is_retired(&self) -> bool {
        self.retired
    }
    #[inline]
    fn set_retired(&mut self) {
        self.retired = true;
    }
}
