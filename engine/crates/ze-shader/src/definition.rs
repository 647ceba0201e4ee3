//! shader 定义文件（TOML）
//!
//! ```toml
//! name = "gbuffer"
//! language = "spirv"
//! model = "6_6"
//!
//! [[options]]
//! name = "ALPHA_TEST"
//! bit = 0
//!
//! [[stages]]
//! stage = "vertex"
//! path = "gbuffer.vert.hlsl"
//!
//! [[stages]]
//! stage = "fragment"
//! path = "gbuffer.frag.hlsl"
//! entry = "ps_main"
//!
//! [[parameters]]
//! name = "albedo"
//! offset = 0
//! ```

use std::{collections::HashSet, path::PathBuf};

use serde::{Deserialize, Serialize};
use ze_gfx::{ShaderLanguage, ShaderModel, ShaderStage};

use crate::error::ShaderError;

/// push constant 的字节上限，bindless 索引参数必须完整落在其中
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

/// 选项位组成的 permutation 标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PermutationId(pub u64);

impl PermutationId {
    #[inline]
    pub fn is_set(self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderOption {
    pub name: String,
    pub bit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderStageDefinition {
    pub stage: ShaderStage,
    /// 相对于文件系统根目录
    pub path: PathBuf,
    #[serde(default = "default_entry")]
    pub entry: String,
}

/// 通过 push constant 传入的 bindless 索引参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderParameterDefinition {
    pub name: String,
    pub offset: u32,
    #[serde(default)]
    pub is_uav: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderDefinition {
    pub name: String,
    #[serde(default = "default_language")]
    pub language: ShaderLanguage,
    #[serde(default = "default_model")]
    pub model: ShaderModel,
    #[serde(default)]
    pub options: Vec<ShaderOption>,
    pub stages: Vec<ShaderStageDefinition>,
    #[serde(default)]
    pub parameters: Vec<ShaderParameterDefinition>,
}

fn default_entry() -> String {
    "main".to_string()
}

fn default_language() -> ShaderLanguage {
    ShaderLanguage::Spirv
}

fn default_model() -> ShaderModel {
    ShaderModel::Sm6_6
}

// new & init
impl ShaderDefinition {
    pub fn from_toml_str(content: &str) -> Result<Self, ShaderError> {
        let definition: Self = toml::from_str(content).map_err(|e| ShaderError::Definition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    fn validate(&self) -> Result<(), ShaderError> {
        let invalid = |message: String| Err(ShaderError::Definition(format!("{}: {}", self.name, message)));

        if self.name.is_empty() {
            return Err(ShaderError::Definition("shader without a name".to_string()));
        }
        if self.stages.is_empty() {
            return invalid("no stages".to_string());
        }

        let mut stages = HashSet::new();
        for stage in &self.stages {
            if !stages.insert(stage.stage) {
                return invalid(format!("stage {:?} declared twice", stage.stage));
            }
        }

        let mut names = HashSet::new();
        let mut bits = HashSet::new();
        for option in &self.options {
            if option.bit >= u64::BITS {
                return invalid(format!("option {} uses bit {}", option.name, option.bit));
            }
            if !names.insert(option.name.as_str()) || !bits.insert(option.bit) {
                return invalid(format!("option {} is not unique", option.name));
            }
        }

        let mut parameters = HashSet::new();
        for parameter in &self.parameters {
            if parameter.offset % 4 != 0 {
                return invalid(format!("parameter {} is not 4-byte aligned", parameter.name));
            }
            if parameter.offset > MAX_PUSH_CONSTANT_SIZE - size_of::<u32>() as u32 {
                return invalid(format!(
                    "parameter {} at offset {} exceeds the {} byte push constant range",
                    parameter.name, parameter.offset, MAX_PUSH_CONSTANT_SIZE
                ));
            }
            if !parameters.insert(parameter.name.as_str()) {
                return invalid(format!("parameter {} declared twice", parameter.name));
            }
        }
        Ok(())
    }
}

// tools
impl ShaderDefinition {
    /// 选项名与开关组合成 permutation；未列出的选项为关闭
    pub fn options_to_permutation(&self, options: &[(&str, bool)]) -> Result<PermutationId, ShaderError> {
        let mut id = 0u64;
        for (name, enabled) in options {
            let option = self
                .options
                .iter()
                .find(|option| option.name == *name)
                .ok_or_else(|| ShaderError::UnknownOption(name.to_string()))?;
            if *enabled {
                id |= 1 << option.bit;
            } else {
                id &= !(1 << option.bit);
            }
        }
        Ok(PermutationId(id))
    }

    /// permutation 展开成宏定义，每个选项都有定义：开启为 1，关闭为 0
    pub fn defines(&self, id: PermutationId) -> Vec<(String, String)> {
        self.options
            .iter()
            .map(|option| {
                let value = if id.is_set(option.bit) { "1" } else { "0" };
                (option.name.clone(), value.to_string())
            })
            .collect()
    }

    /// 所有 stage 的并集
    pub fn stage_flags(&self) -> ze_gfx::ShaderStageFlags {
        self.stages
            .iter()
            .fold(ze_gfx::ShaderStageFlags::empty(), |flags, stage| flags | stage.stage.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GBUFFER: &str = r#"
name = "gbuffer"

[[options]]
name = "ALPHA_TEST"
bit = 0

[[options]]
name = "SKINNED"
bit = 3

[[stages]]
stage = "vertex"
path = "gbuffer.vert.hlsl"

[[stages]]
stage = "fragment"
path = "gbuffer.frag.hlsl"
entry = "ps_main"

[[parameters]]
name = "albedo"
offset = 0

[[parameters]]
name = "output"
offset = 4
is_uav = true
"#;

    #[test]
    fn test_parse_definition() {
        let definition = ShaderDefinition::from_toml_str(GBUFFER).unwrap();
        assert_eq!(definition.name, "gbuffer");
        assert_eq!(definition.language, ShaderLanguage::Spirv);
        assert_eq!(definition.model, ShaderModel::Sm6_6);
        assert_eq!(definition.stages[0].entry, "main");
        assert_eq!(definition.stages[1].entry, "ps_main");
        assert!(definition.parameters[1].is_uav);
        assert_eq!(definition.stage_flags(), ze_gfx::ShaderStageFlags::ALL_GRAPHICS);
    }

    #[test]
    fn test_options_to_permutation() {
        let definition = ShaderDefinition::from_toml_str(GBUFFER).unwrap();

        assert_eq!(definition.options_to_permutation(&[]).unwrap(), PermutationId(0));
        assert_eq!(
            definition.options_to_permutation(&[("SKINNED", true), ("ALPHA_TEST", true)]).unwrap(),
            PermutationId(0b1001)
        );
        assert_eq!(
            definition.options_to_permutation(&[("SKINNED", true), ("SKINNED", false)]).unwrap(),
            PermutationId(0)
        );
        assert!(matches!(
            definition.options_to_permutation(&[("WIREFRAME", true)]),
            Err(ShaderError::UnknownOption(name)) if name == "WIREFRAME"
        ));
    }

    #[test]
    fn test_defines() {
        let definition = ShaderDefinition::from_toml_str(GBUFFER).unwrap();
        let defines = definition.defines(PermutationId(0b1000));
        assert_eq!(
            defines,
            vec![
                ("ALPHA_TEST".to_string(), "0".to_string()),
                ("SKINNED".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(matches!(ShaderDefinition::from_toml_str("name = "), Err(ShaderError::Definition(_))));
        assert!(matches!(
            ShaderDefinition::from_toml_str("name = \"empty\"\nstages = []"),
            Err(ShaderError::Definition(_))
        ));

        let duplicate_bit = r#"
name = "dup"
options = [{ name = "A", bit = 1 }, { name = "B", bit = 1 }]
stages = [{ stage = "compute", path = "dup.hlsl" }]
"#;
        assert!(matches!(ShaderDefinition::from_toml_str(duplicate_bit), Err(ShaderError::Definition(_))));

        let unaligned = r#"
name = "unaligned"
stages = [{ stage = "compute", path = "unaligned.hlsl" }]
parameters = [{ name = "p", offset = 2 }]
"#;
        assert!(matches!(ShaderDefinition::from_toml_str(unaligned), Err(ShaderError::Definition(_))));
    }

    #[test]
    fn test_parameter_offset_limit() {
        let with_offset = |offset: u32| {
            format!(
                "name = \"limit\"\nstages = [{{ stage = \"compute\", path = \"limit.hlsl\" }}]\nparameters = [{{ name = \"p\", offset = {offset} }}]\n"
            )
        };

        let last = ShaderDefinition::from_toml_str(&with_offset(MAX_PUSH_CONSTANT_SIZE - 4)).unwrap();
        assert_eq!(last.parameters[0].offset, 124);

        for offset in [MAX_PUSH_CONSTANT_SIZE, 4096, u32::MAX - 3] {
            assert!(matches!(
                ShaderDefinition::from_toml_str(&with_offset(offset)),
                Err(ShaderError::Definition(_))
            ));
        }
    }
}
