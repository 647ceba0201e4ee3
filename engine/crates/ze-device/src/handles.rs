//! Device 层的资源句柄
//!
//! slot + generation，slot 被复用之后旧句柄会稳定地判定为无效。

use slotmap::new_key_type;

new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct TextureViewHandle;
    pub struct SamplerHandle;
    pub struct ShaderHandle;
    pub struct PipelineLayoutHandle;
    pub struct SwapchainHandle;
    pub struct FenceHandle;
    pub struct SemaphoreHandle;
}
