use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};

use indexmap::IndexMap;
use parking_lot::Mutex;
use ze_device::{Device, PipelineLayoutDesc, PipelineLayoutHandle, ShaderHandle};
use ze_gfx::{ShaderStage, ShaderStageFlags, create_info::ShaderCreateInfo, descriptor::PushConstantRange};

use crate::{
    compiler::{CompiledShader, ShaderCompiler},
    definition::{MAX_PUSH_CONSTANT_SIZE, PermutationId, ShaderDefinition},
    error::ShaderError,
    job::{JobGroup, JobSystem},
};

/// 一个 shader 编译所需的全部输入，由 Shader 和它的 permutation 共享
pub(crate) struct ShaderSource {
    pub definition: ShaderDefinition,
    /// 与 definition.stages 一一对应
    pub sources: Vec<Arc<Vec<u8>>>,
    pub compiler: Arc<dyn ShaderCompiler>,
    pub jobs: Arc<JobSystem>,
}

/// 命名的 shader，按选项组合缓存它的 permutation
pub struct Shader {
    source: Arc<ShaderSource>,
    permutations: Mutex<HashMap<PermutationId, Arc<ShaderPermutation>>>,
}

// new & init
impl Shader {
    pub(crate) fn new(source: ShaderSource) -> Self {
        Self {
            source: Arc::new(source),
            permutations: Mutex::new(HashMap::new()),
        }
    }
}

// getters
impl Shader {
    #[inline]
    pub fn name(&self) -> &str {
        &self.source.definition.name
    }

    #[inline]
    pub fn definition(&self) -> &ShaderDefinition {
        &self.source.definition
    }

    #[inline]
    pub fn permutation_count(&self) -> usize {
        self.permutations.lock().len()
    }
}

// tools
impl Shader {
    /// 取得缓存的 permutation，没有时创建；创建不会触发编译
    pub fn get_permutation(self: &Arc<Self>, id: PermutationId) -> Arc<ShaderPermutation> {
        let mut permutations = self.permutations.lock();
        permutations
            .entry(id)
            .or_insert_with(|| {
                log::debug!("shader {} permutation {:#x} created", self.name(), id.0);
                Arc::new(ShaderPermutation {
                    id,
                    source: self.source.clone(),
                    shader: Arc::downgrade(self),
                    state: Mutex::new(PermutationState::Unavailable),
                })
            })
            .clone()
    }

    pub fn get_permutation_with_options(
        self: &Arc<Self>,
        options: &[(&str, bool)],
    ) -> Result<Arc<ShaderPermutation>, ShaderError> {
        let id = self.source.definition.options_to_permutation(options)?;
        Ok(self.get_permutation(id))
    }

    /// 销毁所有 permutation 的 GPU 对象
    pub fn destroy(&self, device: &Device) {
        for permutation in self.permutations.lock().drain().map(|(_, permutation)| permutation) {
            permutation.destroy(device);
        }
    }
}

/// 通过 push constant 传入的一个 bindless 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderParameter {
    pub offset: u32,
    pub is_uav: bool,
}

/// 编译完成的 stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStage {
    pub shader: ShaderHandle,
    pub entry: String,
}

/// permutation 的编译结果：每个 stage 的 shader，pipeline layout 与参数表
#[derive(Debug)]
pub struct ShaderMap {
    pub stages: BTreeMap<ShaderStage, CompiledStage>,
    pub pipeline_layout: PipelineLayoutHandle,
    /// 按声明顺序
    pub parameters: IndexMap<String, ShaderParameter>,
    pub push_constant_size: u32,
    pub push_constant_stages: ShaderStageFlags,
}

enum PermutationState {
    Unavailable,
    Compiling(JobGroup<Result<CompiledShader, ShaderError>>),
    Available(Arc<ShaderMap>),
}

/// shader 的一个选项组合
///
/// 状态只会从不可用变为可用。编译失败时保持不可用，可以再次编译。
pub struct ShaderPermutation {
    id: PermutationId,
    source: Arc<ShaderSource>,
    shader: Weak<Shader>,
    state: Mutex<PermutationState>,
}

// getters
impl ShaderPermutation {
    #[inline]
    pub fn id(&self) -> PermutationId {
        self.id
    }

    /// 所属的 shader；Shader 已经被释放时返回 None
    #[inline]
    pub fn shader(&self) -> Option<Arc<Shader>> {
        self.shader.upgrade()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.source.definition.name
    }

    pub fn is_available(&self) -> bool {
        matches!(*self.state.lock(), PermutationState::Available(_))
    }
}

// tools
impl ShaderPermutation {
    /// 开始异步编译所有 stage；已经在编译或已经可用时什么都不做
    pub fn compile(&self) {
        let mut state = self.state.lock();
        if matches!(*state, PermutationState::Unavailable) {
            *state = PermutationState::Compiling(self.launch_compile());
        }
    }

    fn launch_compile(&self) -> JobGroup<Result<CompiledShader, ShaderError>> {
        let _span = tracy_client::span!("ShaderPermutation::compile");
        let definition = &self.source.definition;
        log::info!("compiling shader {} permutation {:#x}", definition.name, self.id.0);

        let defines = Arc::new(definition.defines(self.id));
        let jobs = definition.stages.iter().zip(&self.source.sources).map(|(stage, source)| {
            let compiler = self.source.compiler.clone();
            let source = source.clone();
            let defines = defines.clone();
            let stage = stage.stage;
            let language = definition.language;
            let model = definition.model;
            move || compiler.compile(&source, stage, language, model, &defines)
        });
        self.source.jobs.spawn_group(jobs)
    }

    /// 阻塞直到编译完成，返回编译结果
    ///
    /// 还没有开始编译时会先开始编译。编译完成后在调用线程上创建 shader 与 pipeline layout。
    pub fn get_shader_map(&self, device: &Device) -> Result<Arc<ShaderMap>, ShaderError> {
        let mut state = self.state.lock();
        let group = match std::mem::replace(&mut *state, PermutationState::Unavailable) {
            PermutationState::Available(map) => {
                *state = PermutationState::Available(map.clone());
                return Ok(map);
            }
            PermutationState::Compiling(group) => group,
            PermutationState::Unavailable => self.launch_compile(),
        };

        let _span = tracy_client::span!("ShaderPermutation::get_shader_map");
        let compiled = group.wait()?.into_iter().collect::<Result<Vec<_>, _>>().inspect_err(|e| {
            log::error!("shader {} permutation {:#x}: {}", self.name(), self.id.0, e);
        })?;
        let map = Arc::new(self.create_shader_map(device, compiled)?);
        log::info!(
            "shader {} permutation {:#x} available, {} stages",
            self.name(),
            self.id.0,
            map.stages.len()
        );

        *state = PermutationState::Available(map.clone());
        Ok(map)
    }

    fn create_shader_map(&self, device: &Device, compiled: Vec<CompiledShader>) -> Result<ShaderMap, ShaderError> {
        let definition = &self.source.definition;

        // 定义中声明的参数优先，其余来自编译器反射
        let mut parameters = definition
            .parameters
            .iter()
            .map(|parameter| {
                (
                    parameter.name.clone(),
                    ShaderParameter {
                        offset: parameter.offset,
                        is_uav: parameter.is_uav,
                    },
                )
            })
            .collect::<IndexMap<_, _>>();
        let mut push_constant_size = 0;
        for shader in &compiled {
            push_constant_size = push_constant_size.max(shader.reflection.push_constant_size);
            for resource in &shader.reflection.resources {
                parameters.entry(resource.name.clone()).or_insert(ShaderParameter {
                    offset: resource.offset,
                    is_uav: resource.is_uav,
                });
            }
        }
        let index_size = size_of::<u32>() as u32;
        for (name, parameter) in &parameters {
            let end = parameter
                .offset
                .checked_add(index_size)
                .filter(|end| *end <= MAX_PUSH_CONSTANT_SIZE)
                .ok_or_else(|| {
                    ShaderError::Definition(format!(
                        "{}: parameter {} at offset {} exceeds the {} byte push constant range",
                        definition.name, name, parameter.offset, MAX_PUSH_CONSTANT_SIZE
                    ))
                })?;
            push_constant_size = push_constant_size.max(end);
        }
        if push_constant_size > MAX_PUSH_CONSTANT_SIZE {
            return Err(ShaderError::Definition(format!(
                "{}: reflected push constant size {} exceeds {} bytes",
                definition.name, push_constant_size, MAX_PUSH_CONSTANT_SIZE
            )));
        }

        let mut stages = BTreeMap::new();
        for (stage, shader) in definition.stages.iter().zip(compiled) {
            let created = device.create_shader(&ShaderCreateInfo {
                stage: stage.stage,
                bytecode: shader.bytecode,
                debug_name: format!("{}#{:x}-{:?}", definition.name, self.id.0, stage.stage),
            });
            match created {
                Ok(handle) => {
                    stages.insert(
                        stage.stage,
                        CompiledStage {
                            shader: handle,
                            entry: stage.entry.clone(),
                        },
                    );
                }
                Err(e) => {
                    stages.values().for_each(|stage: &CompiledStage| device.destroy_shader(stage.shader));
                    return Err(e.into());
                }
            }
        }

        let push_constant_stages = definition.stage_flags();
        let push_constant_ranges = if push_constant_size > 0 {
            vec![PushConstantRange {
                stages: push_constant_stages,
                offset: 0,
                size: push_constant_size,
            }]
        } else {
            Vec::new()
        };
        let pipeline_layout = match device.create_pipeline_layout(&PipelineLayoutDesc {
            sets: Vec::new(),
            push_constant_ranges,
        }) {
            Ok(layout) => layout,
            Err(e) => {
                stages.values().for_each(|stage| device.destroy_shader(stage.shader));
                return Err(e.into());
            }
        };

        Ok(ShaderMap {
            stages,
            pipeline_layout,
            parameters,
            push_constant_size,
            push_constant_stages,
        })
    }

    /// 销毁编译结果，permutation 回到不可用状态
    pub fn destroy(&self, device: &Device) {
        let mut state = self.state.lock();
        let old = std::mem::replace(&mut *state, PermutationState::Unavailable);
        match old {
            PermutationState::Available(map) => {
                for stage in map.stages.values() {
                    device.destroy_shader(stage.shader);
                }
                device.destroy_pipeline_layout(map.pipeline_layout);
            }
            PermutationState::Compiling(group) => {
                let _ = group.wait();
            }
            PermutationState::Unavailable => {}
        }
    }
}
