use std::{collections::HashMap, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use ze_device::Device;

use crate::{
    compiler::ShaderCompiler,
    definition::ShaderDefinition,
    error::ShaderError,
    file_system::FileSystem,
    job::JobSystem,
    shader::{Shader, ShaderPermutation, ShaderSource},
};

/// 按名字加载并缓存 shader
///
/// shader `name` 的定义位于文件系统中的 `<name>.toml`，各个 stage 的源码路径写在定义里。
pub struct ShaderManager {
    file_system: Arc<dyn FileSystem>,
    compiler: Arc<dyn ShaderCompiler>,
    jobs: Arc<JobSystem>,

    shaders: Mutex<HashMap<String, Arc<Shader>>>,
}

// new & init
impl ShaderManager {
    pub fn new(file_system: Arc<dyn FileSystem>, compiler: Arc<dyn ShaderCompiler>, jobs: Arc<JobSystem>) -> Self {
        log::info!("shader manager created with compiler {}", compiler.name());
        Self {
            file_system,
            compiler,
            jobs,
            shaders: Mutex::new(HashMap::new()),
        }
    }
}

// getters
impl ShaderManager {
    #[inline]
    pub fn shader_count(&self) -> usize {
        self.shaders.lock().len()
    }

    #[inline]
    pub fn jobs(&self) -> &Arc<JobSystem> {
        &self.jobs
    }
}

// tools
impl ShaderManager {
    /// 同一个名字总是返回同一个 `Arc<Shader>`
    pub fn get_shader(&self, name: &str) -> Result<Arc<Shader>, ShaderError> {
        let mut shaders = self.shaders.lock();
        if let Some(shader) = shaders.get(name) {
            return Ok(shader.clone());
        }

        let shader = Arc::new(self.load_shader(name)?);
        shaders.insert(name.to_string(), shader.clone());
        Ok(shader)
    }

    /// 取得 shader 的某个选项组合
    pub fn get_permutation(
        &self,
        name: &str,
        options: &[(&str, bool)],
    ) -> Result<Arc<ShaderPermutation>, ShaderError> {
        self.get_shader(name)?.get_permutation_with_options(options)
    }

    fn load_shader(&self, name: &str) -> Result<Shader, ShaderError> {
        let _span = tracy_client::span!("ShaderManager::load_shader");

        let definition_path = PathBuf::from(format!("{}.toml", name));
        let content = self.file_system.read(&definition_path)?;
        let content = String::from_utf8(content)
            .map_err(|e| ShaderError::Definition(format!("{:?} is not UTF-8: {}", definition_path, e)))?;
        let definition = ShaderDefinition::from_toml_str(&content)?;
        if definition.name != name {
            log::warn!("{:?} declares shader {}, loaded as {}", definition_path, definition.name, name);
        }

        let sources = definition
            .stages
            .iter()
            .map(|stage| self.file_system.read(&stage.path).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "shader {} loaded: {} stages, {} options",
            name,
            definition.stages.len(),
            definition.options.len()
        );
        Ok(Shader::new(ShaderSource {
            definition,
            sources,
            compiler: self.compiler.clone(),
            jobs: self.jobs.clone(),
        }))
    }

    /// 销毁所有 shader 的 GPU 对象并清空缓存
    pub fn destroy(&self, device: &Device) {
        let shaders = std::mem::take(&mut *self.shaders.lock());
        for shader in shaders.values() {
            shader.destroy(device);
        }
        log::info!("shader manager destroyed {} shaders", shaders.len());
    }
}
