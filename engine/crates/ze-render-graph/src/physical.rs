use std::collections::HashMap;

use ze_device::{Device, DeviceError, TextureCreateInfo, TextureHandle, TextureViewCreateInfo, TextureViewHandle};
use ze_gfx::{Format, types::TextureUsage};

/// 物理资源的缓存 key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalKey {
    pub name: String,
    pub format: Format,
    pub width: u32,
    pub height: u32,
}

/// 某个 attachment 在本帧对应的 GPU 资源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAttachment {
    /// backbuffer 由交换链持有，没有可以做 barrier 的 texture
    pub texture: Option<TextureHandle>,
    pub view: TextureViewHandle,
    pub format: Format,
    pub width: u32,
    pub height: u32,
}

struct PhysicalEntry {
    texture: TextureHandle,
    view: TextureViewHandle,
    usage: TextureUsage,
    last_used_frame: u64,
}

/// 跨帧缓存渲染图的物理 texture
///
/// 渲染图每帧重新构建，但同名、同格式、同尺寸的 attachment 会复用上一帧的 texture。
/// 连续若干帧没有被使用的 texture 通过 `evict_unused` 交给 Device 延迟销毁。
#[derive(Default)]
pub struct PhysicalResourceRegistry {
    entries: HashMap<PhysicalKey, PhysicalEntry>,
}

// new & init
impl PhysicalResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

// getters
impl PhysicalResourceRegistry {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, key: &PhysicalKey) -> bool {
        self.entries.contains_key(key)
    }
}

// tools
impl PhysicalResourceRegistry {
    /// 取得 key 对应的 texture，没有或者用途不够时重新创建
    pub fn acquire(
        &mut self,
        device: &Device,
        key: &PhysicalKey,
        usage: TextureUsage,
        frame: u64,
    ) -> Result<PhysicalAttachment, DeviceError> {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.usage.contains(usage) {
                entry.last_used_frame = frame;
                return Ok(PhysicalAttachment {
                    texture: Some(entry.texture),
                    view: entry.view,
                    format: key.format,
                    width: key.width,
                    height: key.height,
                });
            }
        }

        let usage = match self.entries.remove(key) {
            Some(old) => {
                log::debug!("physical attachment {} recreated with usage {:?}", key.name, old.usage | usage);
                device.destroy_texture_view(old.view);
                device.destroy_texture(old.texture);
                old.usage | usage
            }
            None => usage,
        };

        let texture = device.create_texture(
            &TextureCreateInfo::new_2d(key.format, key.width, key.height, usage).with_name(&key.name),
        )?;
        let view = match device.create_texture_view(&TextureViewCreateInfo::whole_2d(texture)) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_texture(texture);
                return Err(e);
            }
        };
        log::debug!("physical attachment {} created: {}x{} {:?}", key.name, key.width, key.height, key.format);

        self.entries.insert(
            key.clone(),
            PhysicalEntry {
                texture,
                view,
                usage,
                last_used_frame: frame,
            },
        );
        Ok(PhysicalAttachment {
            texture: Some(texture),
            view,
            format: key.format,
            width: key.width,
            height: key.height,
        })
    }

    /// 回收 `max_idle_frames` 帧内没有使用过的 texture，返回回收的数量
    pub fn evict_unused(&mut self, device: &Device, current_frame: u64, max_idle_frames: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let keep = current_frame.saturating_sub(entry.last_used_frame) <= max_idle_frames;
            if !keep {
                log::debug!("physical attachment {} evicted", key.name);
                device.destroy_texture_view(entry.view);
                device.destroy_texture(entry.texture);
            }
            keep
        });
        before - self.entries.len()
    }

    /// 销毁所有缓存的 texture
    pub fn clear(&mut self, device: &Device) {
        for (_, entry) in self.entries.drain() {
            device.destroy_texture_view(entry.view);
            device.destroy_texture(entry.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ze_device::DeviceSettings;
    use ze_gfx::headless::HeadlessBackendDevice;

    use super::*;

    fn new_device() -> Device {
        let settings = DeviceSettings {
            debug_validation: false,
            ..DeviceSettings::headless()
        };
        Device::with_backend(Arc::new(HeadlessBackendDevice::new()), settings).unwrap()
    }

    fn key(name: &str) -> PhysicalKey {
        PhysicalKey {
            name: name.to_string(),
            format: Format::R8G8B8A8Unorm,
            width: 128,
            height: 128,
        }
    }

    #[test]
    fn test_reuse_across_frames() {
        let device = new_device();
        let mut registry = PhysicalResourceRegistry::new();

        let first = registry.acquire(&device, &key("color"), TextureUsage::COLOR_ATTACHMENT, 0).unwrap();
        let second = registry.acquire(&device, &key("color"), TextureUsage::COLOR_ATTACHMENT, 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(device.texture_count(), 1);

        let resized = PhysicalKey { width: 256, ..key("color") };
        registry.acquire(&device, &resized, TextureUsage::COLOR_ATTACHMENT, 1).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_recreate_with_wider_usage() {
        let device = new_device();
        let mut registry = PhysicalResourceRegistry::new();

        let first = registry.acquire(&device, &key("color"), TextureUsage::COLOR_ATTACHMENT, 0).unwrap();
        let second = registry.acquire(&device, &key("color"), TextureUsage::SAMPLED, 0).unwrap();
        assert_ne!(first.texture, second.texture);
        assert_eq!(registry.len(), 1);

        let info = device.texture_info(second.texture.unwrap()).unwrap();
        assert!(info.usage.contains(TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED));
    }

    #[test]
    fn test_evict_unused() {
        let device = new_device();
        let mut registry = PhysicalResourceRegistry::new();

        registry.acquire(&device, &key("old"), TextureUsage::COLOR_ATTACHMENT, 0).unwrap();
        registry.acquire(&device, &key("fresh"), TextureUsage::COLOR_ATTACHMENT, 9).unwrap();

        assert_eq!(registry.evict_unused(&device, 10, 8), 1);
        assert!(!registry.contains(&key("old")));
        assert!(registry.contains(&key("fresh")));

        registry.clear(&device);
        assert!(registry.is_empty());
    }
}
