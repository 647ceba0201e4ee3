//! ze 的值类型与 Vulkan 类型之间的转换

use ash::vk;
use ze_gfx::{
    Format, GfxError, GfxResult, ShaderStage, ShaderStageFlags,
    commands::ClearValue,
    descriptor::DescriptorType,
    types::*,
};

pub fn vk_error(result: vk::Result) -> GfxError {
    match result {
        vk::Result::TIMEOUT | vk::Result::NOT_READY => GfxError::Timeout,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GfxError::OutOfDeviceMemory,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => GfxError::OutOfHostMemory,
        vk::Result::ERROR_INITIALIZATION_FAILED => GfxError::InitializationFailed(format!("{:?}", result)),
        other => GfxError::Unknown(format!("{:?}", other)),
    }
}

pub fn gfx_result(result: vk::Result) -> GfxResult {
    match result {
        vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR => GfxResult::Success,
        vk::Result::TIMEOUT | vk::Result::NOT_READY => GfxResult::Timeout,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GfxResult::ErrorOutOfDeviceMemory,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => GfxResult::ErrorOutOfHostMemory,
        vk::Result::ERROR_INITIALIZATION_FAILED => GfxResult::ErrorInitializationFailed,
        _ => GfxResult::ErrorUnknown,
    }
}

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::Undefined => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8G8Unorm => vk::Format::R8G8_UNORM,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Sfloat => vk::Format::R32_SFLOAT,
        Format::R32G32Sfloat => vk::Format::R32G32_SFLOAT,
        Format::R32G32B32Sfloat => vk::Format::R32G32B32_SFLOAT,
        Format::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Sfloat => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// 交换链只会用到颜色格式
pub fn format_from_vk(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::R8G8B8A8_UNORM => Some(Format::R8G8B8A8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(Format::R8G8B8A8Srgb),
        vk::Format::B8G8R8A8_UNORM => Some(Format::B8G8R8A8Unorm),
        vk::Format::B8G8R8A8_SRGB => Some(Format::B8G8R8A8Srgb),
        vk::Format::R16G16B16A16_SFLOAT => Some(Format::R16G16B16A16Sfloat),
        _ => None,
    }
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// view 只能选择一个 depth/stencil aspect，采样时使用 depth
pub fn view_aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    let table = [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::UNORDERED_ACCESS, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
    ];
    for (ze, vk) in table {
        if usage.contains(ze) {
            flags |= vk;
        }
    }
    flags
}

pub fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    let table = [
        (TextureUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (TextureUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (TextureUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (TextureUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (TextureUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (TextureUsage::DEPTH_STENCIL_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (TextureUsage::INPUT_ATTACHMENT, vk::ImageUsageFlags::INPUT_ATTACHMENT),
    ];
    for (ze, vk) in table {
        if usage.contains(ze) {
            flags |= vk;
        }
    }
    flags
}

/// vma 的内存用途；CPU 可见的内存需要声明访问方式才能 map
pub fn allocation_info(usage: MemoryUsage) -> vk_mem::AllocationCreateInfo {
    let (usage, flags) = match usage {
        MemoryUsage::GpuOnly => (vk_mem::MemoryUsage::AutoPreferDevice, vk_mem::AllocationCreateFlags::empty()),
        MemoryUsage::CpuOnly => {
            (vk_mem::MemoryUsage::AutoPreferHost, vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE)
        }
        MemoryUsage::CpuToGpu => (vk_mem::MemoryUsage::Auto, vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE),
        MemoryUsage::GpuToCpu => (vk_mem::MemoryUsage::Auto, vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM),
    };
    vk_mem::AllocationCreateInfo {
        usage,
        flags,
        ..Default::default()
    }
}

pub fn layout(layout: TextureLayout) -> vk::ImageLayout {
    match layout {
        TextureLayout::Undefined => vk::ImageLayout::UNDEFINED,
        TextureLayout::General => vk::ImageLayout::GENERAL,
        TextureLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        TextureLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        TextureLayout::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        TextureLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        TextureLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        TextureLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        TextureLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub fn pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    let table = [
        (PipelineStage::TOP_OF_PIPE, vk::PipelineStageFlags::TOP_OF_PIPE),
        (PipelineStage::DRAW_INDIRECT, vk::PipelineStageFlags::DRAW_INDIRECT),
        (PipelineStage::VERTEX_INPUT, vk::PipelineStageFlags::VERTEX_INPUT),
        (PipelineStage::VERTEX_SHADER, vk::PipelineStageFlags::VERTEX_SHADER),
        (PipelineStage::FRAGMENT_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        (PipelineStage::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS),
        (PipelineStage::LATE_FRAGMENT_TESTS, vk::PipelineStageFlags::LATE_FRAGMENT_TESTS),
        (PipelineStage::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
        (PipelineStage::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER),
        (PipelineStage::TRANSFER, vk::PipelineStageFlags::TRANSFER),
        (PipelineStage::BOTTOM_OF_PIPE, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        (PipelineStage::ALL_GRAPHICS, vk::PipelineStageFlags::ALL_GRAPHICS),
        (PipelineStage::ALL_COMMANDS, vk::PipelineStageFlags::ALL_COMMANDS),
    ];
    let flags = table
        .into_iter()
        .filter(|(ze, _)| stage.contains(*ze))
        .fold(vk::PipelineStageFlags::empty(), |flags, (_, vk)| flags | vk);
    // 空的 stage mask 不合法
    if flags.is_empty() { vk::PipelineStageFlags::TOP_OF_PIPE } else { flags }
}

pub fn access(access: Access) -> vk::AccessFlags {
    let table = [
        (Access::INDIRECT_COMMAND_READ, vk::AccessFlags::INDIRECT_COMMAND_READ),
        (Access::INDEX_READ, vk::AccessFlags::INDEX_READ),
        (Access::VERTEX_ATTRIBUTE_READ, vk::AccessFlags::VERTEX_ATTRIBUTE_READ),
        (Access::UNIFORM_READ, vk::AccessFlags::UNIFORM_READ),
        (Access::INPUT_ATTACHMENT_READ, vk::AccessFlags::INPUT_ATTACHMENT_READ),
        (Access::SHADER_READ, vk::AccessFlags::SHADER_READ),
        (Access::SHADER_WRITE, vk::AccessFlags::SHADER_WRITE),
        (Access::COLOR_ATTACHMENT_READ, vk::AccessFlags::COLOR_ATTACHMENT_READ),
        (Access::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        (Access::DEPTH_STENCIL_ATTACHMENT_READ, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ),
        (Access::DEPTH_STENCIL_ATTACHMENT_WRITE, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
        (Access::TRANSFER_READ, vk::AccessFlags::TRANSFER_READ),
        (Access::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_WRITE),
        (Access::HOST_READ, vk::AccessFlags::HOST_READ),
        (Access::HOST_WRITE, vk::AccessFlags::HOST_WRITE),
        (Access::MEMORY_READ, vk::AccessFlags::MEMORY_READ),
        (Access::MEMORY_WRITE, vk::AccessFlags::MEMORY_WRITE),
    ];
    table
        .into_iter()
        .filter(|(ze, _)| access.contains(*ze))
        .fold(vk::AccessFlags::empty(), |flags, (_, vk)| flags | vk)
}

pub fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

pub fn shader_stage_flags(stages: ShaderStageFlags) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStageFlags::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStageFlags::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStageFlags::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

pub fn load_op(op: AttachmentLoadOp) -> vk::AttachmentLoadOp {
    match op {
        AttachmentLoadOp::Load => vk::AttachmentLoadOp::LOAD,
        AttachmentLoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        AttachmentLoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn store_op(op: AttachmentStoreOp) -> vk::AttachmentStoreOp {
    match op {
        AttachmentStoreOp::Store => vk::AttachmentStoreOp::STORE,
        AttachmentStoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

#[inline]
pub fn samples(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

pub fn texture_view_type(ty: TextureViewType) -> vk::ImageViewType {
    match ty {
        TextureViewType::View2D => vk::ImageViewType::TYPE_2D,
        TextureViewType::View2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureViewType::ViewCube => vk::ImageViewType::CUBE,
        TextureViewType::View3D => vk::ImageViewType::TYPE_3D,
    }
}

pub fn index_type(ty: IndexType) -> vk::IndexType {
    match ty {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub fn bind_point(bind_point: PipelineBindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        PipelineBindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        PipelineBindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

// pipeline states

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub fn color_write_mask(mask: ColorWriteMask) -> vk::ColorComponentFlags {
    vk::ColorComponentFlags::from_raw(mask.bits() as u32)
}

pub fn vertex_input_rate(rate: VertexInputRate) -> vk::VertexInputRate {
    match rate {
        VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
        VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
    }
}

// sampler

pub fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(mode: SamplerMipmapMode) -> vk::SamplerMipmapMode {
    match mode {
        SamplerMipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerMipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_formats_round_trip() {
        for ze in [Format::B8G8R8A8Unorm, Format::B8G8R8A8Srgb, Format::R8G8B8A8Unorm] {
            assert_eq!(format_from_vk(format(ze)), Some(ze));
        }
        assert_eq!(format_from_vk(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn test_depth_aspects() {
        assert_eq!(aspect(Format::D32Sfloat), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(view_aspect(Format::D24UnormS8Uint), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect(Format::R8G8B8A8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_empty_stage_mask_becomes_top_of_pipe() {
        assert_eq!(pipeline_stage(PipelineStage::empty()), vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(
            pipeline_stage(PipelineStage::FRAGMENT_SHADER | PipelineStage::COLOR_ATTACHMENT_OUTPUT),
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn test_usage_flags() {
        assert_eq!(
            buffer_usage(BufferUsage::STORAGE | BufferUsage::UNORDERED_ACCESS | BufferUsage::TRANSFER_DST),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            texture_usage(TextureUsage::SAMPLED | TextureUsage::COLOR_ATTACHMENT),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT
        );
        assert_eq!(
            shader_stage_flags(ShaderStageFlags::ALL_GRAPHICS),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_result_mapping() {
        assert_eq!(gfx_result(vk::Result::TIMEOUT), GfxResult::Timeout);
        assert_eq!(gfx_result(vk::Result::SUBOPTIMAL_KHR), GfxResult::Success);
        assert_eq!(vk_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), GfxError::OutOfDeviceMemory);
        assert!(matches!(vk_error(vk::Result::ERROR_DEVICE_LOST), GfxError::Unknown(_)));
    }
}
