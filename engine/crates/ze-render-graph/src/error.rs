use ze_device::DeviceError;

use crate::render_graph::RenderGraphState;

#[derive(Debug, thiserror::Error)]
pub enum RenderGraphError {
    #[error("no backbuffer attachment was set")]
    MissingBackbuffer,
    #[error("backbuffer attachment {0} is not written by any pass")]
    UnknownBackbuffer(String),
    #[error("dependency cycle between passes {passes:?}")]
    Cycle { passes: Vec<String> },
    #[error("pass {pass} reads {resource}, which no pass writes")]
    ReadWithoutWriter { resource: String, pass: String },
    #[error("pass {pass} uses a depth-stencil attachment as both input and output")]
    DepthStencilReadWrite { pass: String },
    #[error("render graph is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: RenderGraphState,
        actual: RenderGraphState,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}
