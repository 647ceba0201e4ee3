/// 所有后端操作的结果码
///
/// `Timeout` 不是错误：`wait_for_fences` 和 `acquire_swapchain_image` 会把它当作正常结果返回。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GfxResult {
    Success,
    Timeout,
    ErrorUnknown,
    ErrorOutOfDeviceMemory,
    ErrorOutOfHostMemory,
    ErrorInvalidParameter,
    ErrorInitializationFailed,
}

impl GfxResult {
    #[inline]
    pub fn is_success(self) -> bool {
        self == GfxResult::Success
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !matches!(self, GfxResult::Success | GfxResult::Timeout)
    }

    /// 将非 Success 的结果转换为错误，便于使用 `?`
    #[inline]
    pub fn into_result(self) -> Result<(), GfxError> {
        match self {
            GfxResult::Success => Ok(()),
            other => Err(GfxError::from(other)),
        }
    }
}

/// 后端错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GfxError {
    #[error("gpu operation timed out")]
    Timeout,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    #[error("unknown gpu error: {0}")]
    Unknown(String),
}

impl GfxError {
    /// 对应的结果码
    pub fn result(&self) -> GfxResult {
        match self {
            GfxError::Timeout => GfxResult::Timeout,
            GfxError::OutOfDeviceMemory => GfxResult::ErrorOutOfDeviceMemory,
            GfxError::OutOfHostMemory => GfxResult::ErrorOutOfHostMemory,
            GfxError::InvalidParameter(_) => GfxResult::ErrorInvalidParameter,
            GfxError::InitializationFailed(_) => GfxResult::ErrorInitializationFailed,
            GfxError::Unknown(_) => GfxResult::ErrorUnknown,
        }
    }

    #[inline]
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        GfxError::InvalidParameter(msg.into())
    }
}

impl From<GfxResult> for GfxError {
    fn from(value: GfxResult) -> Self {
        match value {
            GfxResult::Timeout => GfxError::Timeout,
            GfxResult::ErrorOutOfDeviceMemory => GfxError::OutOfDeviceMemory,
            GfxResult::ErrorOutOfHostMemory => GfxError::OutOfHostMemory,
            GfxResult::ErrorInvalidParameter => GfxError::InvalidParameter(String::new()),
            GfxResult::ErrorInitializationFailed => GfxError::InitializationFailed(String::new()),
            GfxResult::Success | GfxResult::ErrorUnknown => GfxError::Unknown(format!("{:?}", value)),
        }
    }
}
