use ze_gfx::{DeviceResourceType, GfxError, GfxResult};

use crate::bindless::BindlessDescriptorType;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Backend(#[from] GfxError),
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("stale or invalid {kind:?} handle")]
    InvalidHandle { kind: DeviceResourceType },
    #[error("{what} must have a non-zero size")]
    ZeroSized { what: &'static str },
    #[error("bindless pool {ty:?} (uav: {is_uav}) is exhausted")]
    DescriptorPoolExhausted { ty: BindlessDescriptorType, is_uav: bool },
    #[error("bindless pool {ty:?} does not support uav: {is_uav}")]
    UnsupportedDescriptor { ty: BindlessDescriptorType, is_uav: bool },
    #[error("descriptor set {set} is reserved for bindless or out of range")]
    InvalidDescriptorSet { set: u32 },
    #[error("no pipeline layout is bound")]
    MissingPipelineLayout,
    #[error("command recorded outside of a render pass")]
    NotInRenderPass,
    #[error("fence wait returned {0:?}")]
    FenceWait(GfxResult),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl DeviceError {
    #[inline]
    pub fn invalid_handle(kind: DeviceResourceType) -> Self {
        DeviceError::InvalidHandle { kind }
    }
}
