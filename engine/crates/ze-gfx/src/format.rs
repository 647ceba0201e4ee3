use serde::{Deserialize, Serialize};

/// 纹理/顶点格式
///
/// 与编译后 shader 的反射信息共享同一套数值，跨边界时保持稳定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Sfloat,
    R32Uint,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    D16Unorm,
    D32Sfloat,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, Format::D16Unorm | Format::D32Sfloat | Format::D24UnormS8Uint | Format::D32SfloatS8Uint)
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32SfloatS8Uint)
    }

    /// 单个像素（或顶点分量）所占字节数
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::R8G8Unorm | Format::D16Unorm => 2,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Srgb
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8Srgb
            | Format::R32Uint
            | Format::R32Sfloat
            | Format::D32Sfloat
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Sfloat | Format::R32G32Sfloat | Format::D32SfloatS8Uint => 8,
            Format::R32G32B32Sfloat => 12,
            Format::R32G32B32A32Sfloat => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    #[inline]
    pub fn flag(self) -> ShaderStageFlags {
        match self {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL = Self::ALL_GRAPHICS.bits() | Self::COMPUTE.bits();
    }
}

/// 编译目标语言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderLanguage {
    Spirv,
    Dxil,
    Msl,
}

/// 编译目标的 shader model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShaderModel {
    #[serde(rename = "6_0")]
    Sm6_0,
    #[serde(rename = "6_5")]
    Sm6_5,
    #[serde(rename = "6_6")]
    Sm6_6,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats() {
        assert!(Format::D32Sfloat.is_depth());
        assert!(!Format::D32Sfloat.has_stencil());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::R8G8B8A8Unorm.is_depth());
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(Format::R8G8B8A8Unorm.bytes_per_pixel(), 4);
        assert_eq!(Format::R32G32B32A32Sfloat.bytes_per_pixel(), 16);
        assert_eq!(Format::Undefined.bytes_per_pixel(), 0);
    }
}
