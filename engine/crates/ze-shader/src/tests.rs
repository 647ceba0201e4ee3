use std::sync::Arc;

use parking_lot::Mutex;
use ze_device::{
    BindlessDescriptorType, DescriptorIndexHandle, Device, DeviceSettings, TextureCreateInfo, TextureViewCreateInfo,
};
use ze_gfx::{
    Format, ShaderLanguage, ShaderModel, ShaderStage,
    descriptor::DescriptorType,
    headless::{BackendCall, HeadlessBackendDevice},
    types::{QueueType, TextureUsage},
};

use crate::{
    CompiledShader, FileSystemError, JobSystem, MemoryFileSystem, PassthroughShaderCompiler, ReflectedResource,
    ShaderCompiler, ShaderError, ShaderInstance, ShaderManager, ShaderReflection,
};

const TRIANGLE: &str = r#"
name = "triangle"

[[options]]
name = "ALPHA_TEST"
bit = 0

[[options]]
name = "VERTEX_COLOR"
bit = 1

[[stages]]
stage = "vertex"
path = "triangle.vert.hlsl"

[[stages]]
stage = "fragment"
path = "triangle.frag.hlsl"
entry = "ps_main"

[[parameters]]
name = "albedo"
offset = 0

[[parameters]]
name = "output"
offset = 4
is_uav = true
"#;

fn new_device() -> (Arc<HeadlessBackendDevice>, Device) {
    let backend = Arc::new(HeadlessBackendDevice::new());
    let settings = DeviceSettings {
        debug_validation: false,
        ..DeviceSettings::headless()
    };
    let device = Device::with_backend(backend.clone(), settings).unwrap();
    device.new_frame().unwrap();
    (backend, device)
}

fn triangle_file_system() -> MemoryFileSystem {
    let fs = MemoryFileSystem::new();
    fs.insert("triangle.toml", TRIANGLE);
    fs.insert("triangle.vert.hlsl", "float4 main(uint id : SV_VertexID) : SV_Position { return 0; }");
    fs.insert("triangle.frag.hlsl", "float4 ps_main() : SV_Target { return 1; }");
    fs
}

fn new_manager(fs: MemoryFileSystem, compiler: Arc<dyn ShaderCompiler>) -> ShaderManager {
    ShaderManager::new(Arc::new(fs), compiler, Arc::new(JobSystem::new(2).unwrap()))
}

/// 记录每次编译的宏定义，返回固定的反射信息
#[derive(Default)]
struct RecordingCompiler {
    defines: Mutex<Vec<(ShaderStage, Vec<(String, String)>)>>,
    reflection: ShaderReflection,
}

impl ShaderCompiler for RecordingCompiler {
    fn name(&self) -> &str {
        "recording"
    }

    fn compile(
        &self,
        source: &[u8],
        stage: ShaderStage,
        _language: ShaderLanguage,
        _model: ShaderModel,
        defines: &[(String, String)],
    ) -> Result<CompiledShader, ShaderError> {
        self.defines.lock().push((stage, defines.to_vec()));
        Ok(CompiledShader {
            bytecode: source.to_vec(),
            reflection: self.reflection.clone(),
        })
    }
}

#[test]
fn test_same_shader_and_permutations() {
    let manager = new_manager(triangle_file_system(), Arc::new(PassthroughShaderCompiler));

    let first = manager.get_shader("triangle").unwrap();
    let second = manager.get_shader("triangle").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.shader_count(), 1);

    let alpha = manager.get_permutation("triangle", &[("ALPHA_TEST", true)]).unwrap();
    let alpha_again = manager.get_permutation("triangle", &[("ALPHA_TEST", true)]).unwrap();
    let opaque = manager.get_permutation("triangle", &[("ALPHA_TEST", false)]).unwrap();
    assert!(Arc::ptr_eq(&alpha, &alpha_again));
    assert!(!Arc::ptr_eq(&alpha, &opaque));
    assert_ne!(alpha.id(), opaque.id());

    assert!(Arc::ptr_eq(&alpha.shader().unwrap(), &first));
    assert!(Arc::ptr_eq(&opaque.shader().unwrap(), &first));
    assert_eq!(first.permutation_count(), 2);
}

#[test]
fn test_missing_shader_and_option() {
    let manager = new_manager(triangle_file_system(), Arc::new(PassthroughShaderCompiler));

    assert!(matches!(
        manager.get_shader("missing"),
        Err(ShaderError::FileSystem(FileSystemError::NotFound(_)))
    ));
    assert!(matches!(
        manager.get_permutation("triangle", &[("WIREFRAME", true)]),
        Err(ShaderError::UnknownOption(name)) if name == "WIREFRAME"
    ));
    assert_eq!(manager.shader_count(), 1);
}

#[test]
fn test_compile_and_shader_map() {
    let (_backend, device) = new_device();
    let manager = new_manager(triangle_file_system(), Arc::new(PassthroughShaderCompiler));
    let layouts_before = device.pipeline_layout_count();

    let permutation = manager.get_permutation("triangle", &[("VERTEX_COLOR", true)]).unwrap();
    assert!(!permutation.is_available());
    permutation.compile();
    permutation.compile();

    let map = permutation.get_shader_map(&device).unwrap();
    assert!(permutation.is_available());
    assert_eq!(map.stages.len(), 2);
    assert_eq!(map.stages[&ShaderStage::Fragment].entry, "ps_main");
    assert_eq!(map.push_constant_size, 8);
    assert_eq!(device.shader_count(), 2);
    assert_eq!(device.pipeline_layout_count(), layouts_before + 1);

    // 编译完成后不再创建新的对象
    let again = permutation.get_shader_map(&device).unwrap();
    assert!(Arc::ptr_eq(&map, &again));
    assert_eq!(device.shader_count(), 2);
}

#[test]
fn test_compile_failure_keeps_unavailable() {
    let (_backend, device) = new_device();
    let fs = triangle_file_system();
    fs.insert("triangle.frag.hlsl", "");
    let manager = new_manager(fs, Arc::new(PassthroughShaderCompiler));

    let permutation = manager.get_permutation("triangle", &[]).unwrap();
    for _ in 0..2 {
        assert!(matches!(
            permutation.get_shader_map(&device),
            Err(ShaderError::Compile {
                stage: ShaderStage::Fragment,
                ..
            })
        ));
        assert!(!permutation.is_available());
    }
    assert_eq!(device.shader_count(), 0);
}

#[test]
fn test_defines_follow_permutation() {
    let (_backend, device) = new_device();
    let compiler = Arc::new(RecordingCompiler::default());
    let manager = new_manager(triangle_file_system(), compiler.clone());

    let permutation = manager.get_permutation("triangle", &[("ALPHA_TEST", true)]).unwrap();
    permutation.get_shader_map(&device).unwrap();

    let defines = compiler.defines.lock();
    assert_eq!(defines.len(), 2);
    for (_, stage_defines) in defines.iter() {
        assert!(stage_defines.contains(&("ALPHA_TEST".to_string(), "1".to_string())));
        assert!(stage_defines.contains(&("VERTEX_COLOR".to_string(), "0".to_string())));
    }
}

#[test]
fn test_reflection_merged_with_definition() {
    let (_backend, device) = new_device();
    let resource = |name: &str, offset: u32| ReflectedResource {
        name: name.to_string(),
        set: 0,
        binding: 0,
        ty: DescriptorType::SampledTexture,
        size: 4,
        offset,
        is_uav: false,
    };
    let compiler = Arc::new(RecordingCompiler {
        defines: Mutex::new(Vec::new()),
        reflection: ShaderReflection {
            resources: vec![resource("albedo", 12), resource("normal", 8)],
            push_constant_size: 16,
        },
    });
    let manager = new_manager(triangle_file_system(), compiler);

    let map = manager.get_permutation("triangle", &[]).unwrap().get_shader_map(&device).unwrap();
    assert_eq!(map.parameters.keys().collect::<Vec<_>>(), vec!["albedo", "output", "normal"]);
    assert_eq!(map.parameters["albedo"].offset, 0);
    assert_eq!(map.parameters["normal"].offset, 8);
    assert_eq!(map.push_constant_size, 16);
}

#[test]
fn test_reflected_offset_out_of_range() {
    let (_backend, device) = new_device();
    let reflected = |offset: u32, push_constant_size: u32| {
        Arc::new(RecordingCompiler {
            defines: Mutex::new(Vec::new()),
            reflection: ShaderReflection {
                resources: vec![ReflectedResource {
                    name: "huge".to_string(),
                    set: 0,
                    binding: 0,
                    ty: DescriptorType::SampledTexture,
                    size: 4,
                    offset,
                    is_uav: false,
                }],
                push_constant_size,
            },
        })
    };

    for (offset, push_constant_size) in [(u32::MAX - 1, 0), (128, 0), (8, 4096)] {
        let manager = new_manager(triangle_file_system(), reflected(offset, push_constant_size));
        let permutation = manager.get_permutation("triangle", &[]).unwrap();
        assert!(matches!(permutation.get_shader_map(&device), Err(ShaderError::Definition(_))));
        assert!(!permutation.is_available());
    }
    assert_eq!(device.shader_count(), 0);

    // 最后一个合法偏移
    let manager = new_manager(triangle_file_system(), reflected(124, 0));
    let map = manager.get_permutation("triangle", &[]).unwrap().get_shader_map(&device).unwrap();
    assert_eq!(map.parameters["huge"].offset, 124);
    assert_eq!(map.push_constant_size, 128);
}

#[test]
fn test_instance_parameters() {
    let (_backend, device) = new_device();
    let manager = new_manager(triangle_file_system(), Arc::new(PassthroughShaderCompiler));
    let permutation = manager.get_permutation("triangle", &[]).unwrap();
    let mut instance = ShaderInstance::new(&device, permutation).unwrap();
    assert_eq!(instance.push_constants(), &[0; 8]);

    instance
        .set_parameter(
            "output",
            DescriptorIndexHandle {
                ty: BindlessDescriptorType::Texture2D,
                is_uav: true,
                index: 7,
            },
        )
        .unwrap();
    assert_eq!(&instance.push_constants()[4..8], &7u32.to_le_bytes());

    assert!(matches!(
        instance.set_parameter(
            "roughness",
            DescriptorIndexHandle {
                ty: BindlessDescriptorType::Texture2D,
                is_uav: false,
                index: 1,
            }
        ),
        Err(ShaderError::UnknownParameter { name }) if name == "roughness"
    ));

    let texture = device
        .create_texture(&TextureCreateInfo::new_2d(Format::R8G8B8A8Unorm, 16, 16, TextureUsage::SAMPLED))
        .unwrap();
    let view = device.create_texture_view(&TextureViewCreateInfo::whole_2d(texture)).unwrap();
    instance.set_texture(&device, "albedo", view).unwrap();
    let index = device.texture_view_descriptor_index(view, false).unwrap().index;
    assert_eq!(&instance.push_constants()[0..4], &index.to_le_bytes());

    // 没有 STORAGE 用途的 texture 没有 UAV 索引
    assert!(matches!(
        instance.set_texture(&device, "output", view),
        Err(ShaderError::Device(_))
    ));
}

#[test]
fn test_bind_records_state() {
    let (backend, device) = new_device();
    let manager = new_manager(triangle_file_system(), Arc::new(PassthroughShaderCompiler));
    let permutation = manager.get_permutation("triangle", &[]).unwrap();
    let instance = ShaderInstance::new(&device, permutation).unwrap();

    let mut cmd = device.allocate_command_list(QueueType::Gfx).unwrap();
    instance.bind(&device, &mut cmd).unwrap();

    let map = instance.shader_map();
    assert_eq!(cmd.pipeline_layout(), Some(map.pipeline_layout));
    let bound = &cmd.graphics_state().shader_stages;
    assert_eq!(bound.len(), 2);
    assert_eq!(bound[&ShaderStage::Vertex].0, map.stages[&ShaderStage::Vertex].shader);
    assert_eq!(bound[&ShaderStage::Fragment].1, "ps_main");
    assert_eq!(
        backend.count_calls(|call| matches!(call, BackendCall::PushConstants { data, .. } if data.len() == 8)),
        1
    );

    device.submit(cmd, &[], &[]).unwrap();
}

#[test]
fn test_destroy_releases_gpu_objects() {
    let (_backend, device) = new_device();
    let manager = new_manager(triangle_file_system(), Arc::new(PassthroughShaderCompiler));
    let permutation = manager.get_permutation("triangle", &[]).unwrap();
    permutation.get_shader_map(&device).unwrap();
    assert_eq!(device.shader_count(), 2);

    manager.destroy(&device);
    assert_eq!(manager.shader_count(), 0);
    assert!(!permutation.is_available());

    for _ in 0..=device.max_frames_in_flight() {
        device.new_frame().unwrap();
    }
    assert_eq!(device.shader_count(), 0);
}
