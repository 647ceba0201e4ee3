use ze_device::DeviceError;
use ze_gfx::ShaderStage;

use crate::file_system::FileSystemError;

#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),
    #[error("invalid shader definition: {0}")]
    Definition(String),
    #[error("failed to compile {stage:?} stage: {message}")]
    Compile { stage: ShaderStage, message: String },
    #[error("unknown permutation option {0}")]
    UnknownOption(String),
    #[error("unknown shader parameter {name}")]
    UnknownParameter { name: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// 任务在产出结果之前终止（panic 或线程池被销毁）
    #[error("job canceled before producing a result")]
    JobCanceled,
}
