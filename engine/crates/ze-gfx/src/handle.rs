use std::{fmt, hash::Hash, marker::PhantomData};

/// 后端资源的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceResourceType {
    Buffer,
    Texture,
    TextureView,
    CommandPool,
    CommandList,
    Pipeline,
    PipelineLayout,
    RenderPass,
    Swapchain,
    Sampler,
    Shader,
    Fence,
    Semaphore,
    DescriptorPool,
    DescriptorSet,
}

/// 编译期的资源种类标记
///
/// 每种资源对应一个不可实例化的 marker 类型，句柄通过 `PhantomData` 携带该类型，
/// 不同种类的句柄因此无法互相传递，运行时没有额外开销。
pub trait ResourceKind: 'static {
    const TYPE: DeviceResourceType;
}

macro_rules! define_resource_kinds {
    ($($kind:ident => $ty:ident, $alias:ident;)*) => {
        $(
            #[derive(Debug)]
            pub enum $kind {}
            impl ResourceKind for $kind {
                const TYPE: DeviceResourceType = DeviceResourceType::$ty;
            }
            pub type $alias = DeviceResourceHandle<$kind>;
        )*
    };
}

define_resource_kinds! {
    BufferKind => Buffer, RawBufferHandle;
    TextureKind => Texture, RawTextureHandle;
    TextureViewKind => TextureView, RawTextureViewHandle;
    CommandPoolKind => CommandPool, RawCommandPoolHandle;
    CommandListKind => CommandList, RawCommandListHandle;
    PipelineKind => Pipeline, RawPipelineHandle;
    PipelineLayoutKind => PipelineLayout, RawPipelineLayoutHandle;
    RenderPassKind => RenderPass, RawRenderPassHandle;
    SwapchainKind => Swapchain, RawSwapchainHandle;
    SamplerKind => Sampler, RawSamplerHandle;
    ShaderKind => Shader, RawShaderHandle;
    FenceKind => Fence, RawFenceHandle;
    SemaphoreKind => Semaphore, RawSemaphoreHandle;
    DescriptorPoolKind => DescriptorPool, RawDescriptorPoolHandle;
    DescriptorSetKind => DescriptorSet, RawDescriptorSetHandle;
}

/// 后端资源句柄
///
/// 只是一个不透明的整数索引，本身不拥有资源；资源的所有权由 Device 管理。
/// `index` 的含义由具体后端决定。
pub struct DeviceResourceHandle<K: ResourceKind> {
    index: u64,
    _kind: PhantomData<fn() -> K>,
}

// new & init
impl<K: ResourceKind> DeviceResourceHandle<K> {
    pub const NULL_INDEX: u64 = u64::MAX;

    #[inline]
    pub const fn new(index: u64) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }

    /// 表示“没有资源”的哨兵值
    #[inline]
    pub const fn null() -> Self {
        Self::new(Self::NULL_INDEX)
    }
}

// getters
impl<K: ResourceKind> DeviceResourceHandle<K> {
    #[inline]
    pub const fn index(&self) -> u64 {
        self.index
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.index == Self::NULL_INDEX
    }

    #[inline]
    pub const fn resource_type() -> DeviceResourceType {
        K::TYPE
    }

    /// 擦除编译期类型，用于需要统一存放各种句柄的场景（日志、调用记录）
    #[inline]
    pub const fn erase(self) -> RawResourceHandle {
        RawResourceHandle {
            ty: K::TYPE,
            index: self.index,
        }
    }
}

impl<K: ResourceKind> Clone for DeviceResourceHandle<K> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<K: ResourceKind> Copy for DeviceResourceHandle<K> {}

impl<K: ResourceKind> PartialEq for DeviceResourceHandle<K> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<K: ResourceKind> Eq for DeviceResourceHandle<K> {}

impl<K: ResourceKind> Hash for DeviceResourceHandle<K> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<K: ResourceKind> PartialOrd for DeviceResourceHandle<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K: ResourceKind> Ord for DeviceResourceHandle<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<K: ResourceKind> Default for DeviceResourceHandle<K> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<K: ResourceKind> fmt::Debug for DeviceResourceHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "{:?}(null)", K::TYPE)
        } else {
            write!(f, "{:?}({})", K::TYPE, self.index)
        }
    }
}

/// 类型擦除后的句柄，运行时携带资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawResourceHandle {
    pub ty: DeviceResourceType,
    pub index: u64,
}

impl RawResourceHandle {
    /// 恢复为带类型的句柄；种类不匹配是调用方的编程错误
    #[inline]
    pub fn cast<K: ResourceKind>(self) -> DeviceResourceHandle<K> {
        debug_assert_eq!(self.ty, K::TYPE, "resource handle type mismatch");
        DeviceResourceHandle::new(self.index)
    }

    /// 与 [`Self::cast`] 相同，但种类不匹配时返回 None
    #[inline]
    pub fn try_cast<K: ResourceKind>(self) -> Option<DeviceResourceHandle<K>> {
        (self.ty == K::TYPE).then(|| DeviceResourceHandle::new(self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        let handle = RawBufferHandle::null();
        assert!(handle.is_null());
        assert_eq!(handle, RawBufferHandle::default());
        assert!(!RawBufferHandle::new(0).is_null());
    }

    #[test]
    fn test_erase_and_cast() {
        let handle = RawTextureHandle::new(42);
        let raw = handle.erase();
        assert_eq!(raw.ty, DeviceResourceType::Texture);
        assert_eq!(raw.cast::<TextureKind>(), handle);
        assert!(raw.try_cast::<BufferKind>().is_none());
    }

    #[test]
    fn test_resource_type_of_aliases() {
        assert_eq!(RawFenceHandle::resource_type(), DeviceResourceType::Fence);
        assert_eq!(RawSemaphoreHandle::resource_type(), DeviceResourceType::Semaphore);
        assert_eq!(RawCommandListHandle::resource_type(), DeviceResourceType::CommandList);
        assert_eq!(format!("{:?}", RawShaderHandle::new(7)), "Shader(7)");
    }
}
