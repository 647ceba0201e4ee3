//! shader 编译器的接口
//!
//! 输入源码、stage、目标语言与 shader model，输出后端字节码和反射信息。

use ze_gfx::{ShaderLanguage, ShaderModel, ShaderStage, descriptor::DescriptorType};

use crate::error::ShaderError;

/// 反射得到的一个资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedResource {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub ty: DescriptorType,
    pub size: u32,
    /// bindless 索引在 push constant 中的字节偏移
    pub offset: u32,
    pub is_uav: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderReflection {
    pub resources: Vec<ReflectedResource>,
    pub push_constant_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledShader {
    pub bytecode: Vec<u8>,
    pub reflection: ShaderReflection,
}

pub trait ShaderCompiler: Send + Sync {
    fn name(&self) -> &str;

    /// `defines` 为 permutation 选项展开后的宏
    fn compile(
        &self,
        source: &[u8],
        stage: ShaderStage,
        language: ShaderLanguage,
        model: ShaderModel,
        defines: &[(String, String)],
    ) -> Result<CompiledShader, ShaderError>;
}

/// 不做编译：把宏定义拼到源码前面作为字节码
///
/// 用于 headless 后端与测试，反射信息全部来自 shader 定义。
#[derive(Debug, Default)]
pub struct PassthroughShaderCompiler;

impl ShaderCompiler for PassthroughShaderCompiler {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn compile(
        &self,
        source: &[u8],
        stage: ShaderStage,
        _language: ShaderLanguage,
        _model: ShaderModel,
        defines: &[(String, String)],
    ) -> Result<CompiledShader, ShaderError> {
        if source.is_empty() {
            return Err(ShaderError::Compile {
                stage,
                message: "empty source".to_string(),
            });
        }

        let mut bytecode = Vec::with_capacity(source.len() + defines.len() * 16);
        for (name, value) in defines {
            bytecode.extend_from_slice(format!("#define {} {}\n", name, value).as_bytes());
        }
        bytecode.extend_from_slice(source);
        Ok(CompiledShader {
            bytecode,
            reflection: ShaderReflection::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_prepends_defines() {
        let compiled = PassthroughShaderCompiler
            .compile(
                b"void main() {}",
                ShaderStage::Vertex,
                ShaderLanguage::Spirv,
                ShaderModel::Sm6_6,
                &[("ALPHA_TEST".to_string(), "1".to_string())],
            )
            .unwrap();
        assert_eq!(compiled.bytecode, b"#define ALPHA_TEST 1\nvoid main() {}");
        assert_eq!(compiled.reflection, ShaderReflection::default());
    }

    #[test]
    fn test_passthrough_rejects_empty_source() {
        let result =
            PassthroughShaderCompiler.compile(b"", ShaderStage::Fragment, ShaderLanguage::Spirv, ShaderModel::Sm6_6, &[]);
        assert!(matches!(
            result,
            Err(ShaderError::Compile {
                stage: ShaderStage::Fragment,
                ..
            })
        ));
    }
}
