use std::collections::BTreeSet;

use slotmap::new_key_type;
use ze_gfx::{Format, types::TextureUsage};

new_key_type! {
    /// 渲染图内部的虚拟 attachment，只在一帧的图中有效
    pub struct AttachmentId;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AttachmentSize {
    /// 与 backbuffer 同样大小
    #[default]
    Backbuffer,
    /// 相对 backbuffer 的缩放
    BackbufferRelative(f32),
    Absolute { width: u32, height: u32 },
}

impl AttachmentSize {
    pub fn resolve(self, backbuffer_width: u32, backbuffer_height: u32) -> (u32, u32) {
        match self {
            AttachmentSize::Backbuffer => (backbuffer_width, backbuffer_height),
            AttachmentSize::BackbufferRelative(scale) => (
                ((backbuffer_width as f32 * scale) as u32).max(1),
                ((backbuffer_height as f32 * scale) as u32).max(1),
            ),
            AttachmentSize::Absolute { width, height } => (width, height),
        }
    }
}

/// 输出 attachment 的描述
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentInfo {
    pub format: Format,
    pub size: AttachmentSize,
}

impl AttachmentInfo {
    #[inline]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            size: AttachmentSize::Backbuffer,
        }
    }

    #[inline]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = AttachmentSize::Absolute { width, height };
        self
    }

    #[inline]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.size = AttachmentSize::BackbufferRelative(scale);
        self
    }
}

/// 图中按名字引用的 attachment
///
/// 第一次被任意 pass 引用时创建。记录读写它的 pass 以及所有用途的并集，
/// 编译之后绑定到一个物理资源。
#[derive(Debug, Clone)]
pub struct AttachmentResource {
    pub name: String,
    /// 第一个输出声明的描述；只被读取的 attachment 没有描述
    pub info: Option<AttachmentInfo>,
    pub readers: BTreeSet<usize>,
    pub writers: BTreeSet<usize>,
    pub usage: TextureUsage,
    pub(crate) physical_index: Option<usize>,
}

impl AttachmentResource {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            info: None,
            readers: BTreeSet::new(),
            writers: BTreeSet::new(),
            usage: TextureUsage::empty(),
            physical_index: None,
        }
    }

    #[inline]
    pub fn physical_index(&self) -> Option<usize> {
        self.physical_index
    }

    #[inline]
    pub fn is_depth(&self) -> bool {
        self.info.is_some_and(|info| info.format.is_depth())
    }

    /// 记录输出描述；同名 attachment 的描述不一致时保留第一个
    pub(crate) fn set_info(&mut self, info: AttachmentInfo) {
        match self.info {
            None => self.info = Some(info),
            Some(existing) if existing != info => {
                log::warn!(
                    "attachment {} declared as {:?} and {:?}, keeping the first",
                    self.name,
                    existing,
                    info
                );
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_resolve() {
        assert_eq!(AttachmentSize::Backbuffer.resolve(800, 600), (800, 600));
        assert_eq!(AttachmentSize::BackbufferRelative(0.5).resolve(800, 600), (400, 300));
        assert_eq!(AttachmentSize::BackbufferRelative(0.0001).resolve(800, 600), (1, 1));
        assert_eq!(AttachmentSize::Absolute { width: 64, height: 32 }.resolve(800, 600), (64, 32));
    }

    #[test]
    fn test_first_info_wins() {
        let mut resource = AttachmentResource::new("color");
        resource.set_info(AttachmentInfo::new(Format::R8G8B8A8Unorm));
        resource.set_info(AttachmentInfo::new(Format::R16G16B16A16Sfloat));
        assert_eq!(resource.info.map(|info| info.format), Some(Format::R8G8B8A8Unorm));
        assert!(!resource.is_depth());
    }
}
