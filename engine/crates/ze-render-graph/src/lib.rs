//! 声明式渲染图
//!
//! 每帧重新构建：`add_gfx_pass` 声明各个 pass 读写的 attachment，
//! `compile` 推导依赖、剔除无用 pass、排序并分配物理资源，`execute` 按顺序录制 barrier 与 render pass。
//!
//! # 使用流程
//!
//! ```ignore
//! let mut graph = RenderGraph::new();
//! graph.add_gfx_pass(
//!     "gbuffer",
//!     |builder| {
//!         builder.add_color_output("albedo", AttachmentInfo::new(Format::R8G8B8A8Unorm));
//!     },
//!     |ctx| { /* draw */ Ok(()) },
//! );
//! graph.add_gfx_pass(
//!     "lighting",
//!     |builder| {
//!         builder.add_attachment_input("albedo");
//!         builder.add_color_output("backbuffer", AttachmentInfo::new(swapchain_format));
//!     },
//!     |ctx| { /* fullscreen triangle */ Ok(()) },
//! );
//! graph.set_backbuffer_attachment("backbuffer", swapchain_view, width, height);
//! graph.compile(&device, &mut physical_registry)?;
//! graph.execute(&device, &mut cmd)?;
//! ```

mod attachment;
mod barrier;
mod dependency;
mod error;
mod pass;
mod physical;
mod render_graph;

pub use attachment::{AttachmentId, AttachmentInfo, AttachmentResource, AttachmentSize};
pub use barrier::GraphBarrier;
pub use dependency::DependencyGraph;
pub use error::RenderGraphError;
pub use pass::{ColorOutput, PassBuilder, PassContext};
pub use physical::{PhysicalAttachment, PhysicalKey, PhysicalResourceRegistry};
pub use render_graph::{RenderGraph, RenderGraphState};
