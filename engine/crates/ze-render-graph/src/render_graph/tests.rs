use std::{cell::RefCell, sync::Arc};

use ze_device::{
    CommandList, Device, DeviceError, DeviceSettings, TextureCreateInfo, TextureViewCreateInfo, TextureViewHandle,
};
use ze_gfx::{
    Format,
    headless::{BackendCall, HeadlessBackendDevice},
    types::{QueueType, TextureLayout, TextureUsage},
};

use super::{RenderGraph, RenderGraphState};
use crate::{
    attachment::AttachmentInfo, error::RenderGraphError, pass::PassContext, physical::PhysicalResourceRegistry,
};

const COLOR: Format = Format::R8G8B8A8Unorm;

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

fn create_backbuffer(device: &Device, width: u32, height: u32) -> TextureViewHandle {
    let texture = device
        .create_texture(&TextureCreateInfo::new_2d(COLOR, width, height, TextureUsage::COLOR_ATTACHMENT))
        .unwrap();
    device.create_texture_view(&TextureViewCreateInfo::whole_2d(texture)).unwrap()
}

fn noop(_: &mut PassContext<'_>) -> Result<(), DeviceError> {
    Ok(())
}

fn compile(graph: &mut RenderGraph, device: &Device) -> Result<(), RenderGraphError> {
    graph.compile(device, &mut PhysicalResourceRegistry::new())
}

fn execute(graph: &mut RenderGraph, device: &Device) -> Result<(), RenderGraphError> {
    let mut cmd: CommandList = device.allocate_command_list(QueueType::Gfx).unwrap();
    let result = graph.execute(device, &mut cmd);
    device.submit(cmd, &[], &[]).unwrap();
    result
}

#[test]
fn test_two_pass_scenario() {
    let (backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 800, 600);
    let executed = RefCell::new(Vec::new());

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "A",
        |builder| {
            builder.add_color_output("color", AttachmentInfo::new(COLOR));
        },
        |ctx| {
            assert_eq!(ctx.extent(), (800, 600));
            executed.borrow_mut().push(ctx.pass_name().to_string());
            Ok(())
        },
    );
    graph.add_gfx_pass(
        "B",
        |builder| {
            builder.add_attachment_input("color");
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        |ctx| {
            assert!(ctx.sampled_index("color").is_some());
            assert_eq!(ctx.texture_view("backbuffer"), Some(backbuffer));
            executed.borrow_mut().push(ctx.pass_name().to_string());
            Ok(())
        },
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 800, 600);

    compile(&mut graph, &device).unwrap();
    assert_eq!(graph.state(), RenderGraphState::Compiled);
    assert_eq!(graph.pass_list(), vec!["A", "B"]);
    assert!(graph.barriers_for("B").unwrap().iter().any(|barrier| {
        graph.attachment_name(barrier.resource) == Some("color")
            && barrier.old_layout == TextureLayout::ColorAttachment
            && barrier.new_layout == TextureLayout::ShaderReadOnly
    }));

    backend.clear_calls();
    execute(&mut graph, &device).unwrap();
    assert_eq!(graph.state(), RenderGraphState::Executed);
    assert_eq!(*executed.borrow(), vec!["A", "B"]);

    let calls = backend.calls();
    let begins = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| matches!(call, BackendCall::BeginRenderPass { .. }))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let ends = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| matches!(call, BackendCall::EndRenderPass(_)))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    assert_eq!(begins.len(), 2);
    assert_eq!(ends.len(), 2);

    let barrier = calls
        .iter()
        .position(|call| match call {
            BackendCall::PipelineBarrier { textures, .. } => textures.iter().any(|barrier| {
                barrier.old_layout == TextureLayout::ColorAttachment
                    && barrier.new_layout == TextureLayout::ShaderReadOnly
            }),
            _ => false,
        })
        .unwrap();
    assert!(ends[0] < barrier && barrier < begins[1]);

    match &calls[begins[1]] {
        BackendCall::BeginRenderPass { width, height, .. } => assert_eq!((*width, *height), (800, 600)),
        _ => unreachable!(),
    }
}

#[test]
fn test_dead_pass_culled() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);
    let executed = RefCell::new(Vec::new());

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "shadow",
        |builder| {
            builder.set_depth_stencil_output("shadow_map", AttachmentInfo::new(Format::D32Sfloat).with_size(1024, 1024));
        },
        |_| {
            executed.borrow_mut().push("shadow");
            Ok(())
        },
    );
    graph.add_gfx_pass(
        "main",
        |builder| {
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        |_| {
            executed.borrow_mut().push("main");
            Ok(())
        },
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);

    compile(&mut graph, &device).unwrap();
    assert_eq!(graph.pass_list(), vec!["main"]);
    assert!(graph.barriers_for("shadow").is_none());
    assert!(graph.physical_attachment("shadow_map").is_none());
    // 只有 backbuffer
    assert_eq!(device.texture_count(), 1);

    execute(&mut graph, &device).unwrap();
    assert_eq!(*executed.borrow(), vec!["main"]);
}

#[test]
fn test_independent_passes_keep_declaration_order() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 320, 240);
    let mut registry = PhysicalResourceRegistry::new();

    for _ in 0..16 {
        let mut graph = RenderGraph::new();
        for (pass, output) in [("bloom", "bloom"), ("gbuffer", "albedo"), ("ao", "ao")] {
            graph.add_gfx_pass(
                pass,
                |builder| {
                    builder.add_color_output(output, AttachmentInfo::new(COLOR).with_scale(0.5));
                },
                noop,
            );
        }
        graph.add_gfx_pass(
            "composite",
            |builder| {
                builder.add_attachment_input("ao");
                builder.add_attachment_input("albedo");
                builder.add_attachment_input("bloom");
                builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
            },
            noop,
        );
        graph.set_backbuffer_attachment("backbuffer", backbuffer, 320, 240);

        graph.compile(&device, &mut registry).unwrap();
        assert_eq!(graph.pass_list(), vec!["bloom", "gbuffer", "ao", "composite"]);
        assert_eq!(graph.dependency_graph().unwrap().edge_count(), 3);

        let ao = graph.physical_attachment("ao").unwrap();
        assert_eq!((ao.width, ao.height), (160, 120));
    }
    assert_eq!(registry.len(), 3);
}

#[test]
fn test_read_of_later_writer_rejected() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);

    // A 读取的 y 只在之后声明的 B 中写入
    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "A",
        |builder| {
            builder.add_attachment_input("y");
            builder.add_color_output("x", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.add_gfx_pass(
        "B",
        |builder| {
            builder.add_attachment_input("x");
            builder.add_color_output("y", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.add_gfx_pass(
        "C",
        |builder| {
            builder.add_attachment_input("x");
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);

    match compile(&mut graph, &device) {
        Err(RenderGraphError::ReadWithoutWriter { resource, pass }) => {
            assert_eq!(resource, "y");
            assert_eq!(pass, "A");
        }
        other => panic!("expected ReadWithoutWriter, got {:?}", other),
    }
    assert_eq!(graph.state(), RenderGraphState::Building);
}

#[test]
fn test_rewritten_attachment_ping_pong() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 256, 256);
    let mut registry = PhysicalResourceRegistry::new();

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "bright",
        |builder| {
            builder.add_color_output("bloom", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.add_gfx_pass(
        "blur_h",
        |builder| {
            builder.add_attachment_input("bloom");
            builder.add_color_output("tmp", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.add_gfx_pass(
        "blur_v",
        |builder| {
            builder.add_attachment_input("tmp");
            builder.add_color_output("bloom", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    // bloom 之后被 blur_v 覆盖，这次写入没有人读取
    graph.add_gfx_pass(
        "stale_bloom",
        |builder| {
            builder.add_color_output("bloom", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.add_gfx_pass(
        "blur_v2",
        |builder| {
            builder.add_attachment_input("tmp");
            builder.add_color_output("bloom", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.add_gfx_pass(
        "composite",
        |builder| {
            builder.add_attachment_input("bloom");
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 256, 256);

    graph.compile(&device, &mut registry).unwrap();
    assert_eq!(graph.pass_list(), vec!["bright", "blur_h", "blur_v2", "composite"]);

    // 同名的 attachment 只有一个物理资源
    assert_eq!(registry.len(), 2);
    let blur_v2 = graph.barriers_for("blur_v2").unwrap();
    assert!(blur_v2.iter().any(|barrier| {
        graph.attachment_name(barrier.resource) == Some("bloom")
            && barrier.old_layout == TextureLayout::Undefined
            && barrier.new_layout == TextureLayout::ColorAttachment
    }));
    let composite = graph.barriers_for("composite").unwrap();
    assert!(composite.iter().any(|barrier| {
        graph.attachment_name(barrier.resource) == Some("bloom")
            && barrier.old_layout == TextureLayout::ColorAttachment
            && barrier.new_layout == TextureLayout::ShaderReadOnly
    }));

    // blur_h 读取 bloom 之后 blur_v2 才能覆盖它
    let dependency = graph.dependency_graph().unwrap();
    assert!(dependency.predecessors(4).contains(&1));
    assert!(dependency.predecessors(5).contains(&4));

    registry.clear(&device);
}

#[test]
fn test_read_without_writer() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "main",
        |builder| {
            builder.add_attachment_input("missing");
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);
    match compile(&mut graph, &device) {
        Err(RenderGraphError::ReadWithoutWriter { resource, pass }) => {
            assert_eq!(resource, "missing");
            assert_eq!(pass, "main");
        }
        other => panic!("expected ReadWithoutWriter, got {:?}", other),
    }

    // 在没有内容的 attachment 上继续绘制
    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "overlay",
        |builder| {
            builder.add_color_input_output("backbuffer");
        },
        noop,
    );
    graph.add_gfx_pass(
        "main",
        |builder| {
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);
    assert!(matches!(
        compile(&mut graph, &device),
        Err(RenderGraphError::ReadWithoutWriter { pass, .. }) if pass == "overlay"
    ));
}

#[test]
fn test_depth_read_write_rejected() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "bad",
        |builder| {
            builder.set_depth_stencil_input("depth");
            builder.set_depth_stencil_output("depth", AttachmentInfo::new(Format::D32Sfloat));
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);
    assert!(matches!(
        compile(&mut graph, &device),
        Err(RenderGraphError::DepthStencilReadWrite { pass }) if pass == "bad"
    ));
}

#[test]
fn test_backbuffer_errors() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "main",
        |builder| {
            builder.add_color_output("color", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    assert!(matches!(compile(&mut graph, &device), Err(RenderGraphError::MissingBackbuffer)));

    graph.set_backbuffer_attachment("nothing", backbuffer, 64, 64);
    assert!(matches!(
        compile(&mut graph, &device),
        Err(RenderGraphError::UnknownBackbuffer(name)) if name == "nothing"
    ));
}

#[test]
fn test_state_transitions() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "main",
        |builder| {
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);

    assert!(matches!(
        execute(&mut graph, &device),
        Err(RenderGraphError::InvalidState {
            expected: RenderGraphState::Compiled,
            actual: RenderGraphState::Building,
        })
    ));

    compile(&mut graph, &device).unwrap();
    assert!(matches!(
        compile(&mut graph, &device),
        Err(RenderGraphError::InvalidState {
            expected: RenderGraphState::Building,
            actual: RenderGraphState::Compiled,
        })
    ));

    execute(&mut graph, &device).unwrap();
    assert!(matches!(
        execute(&mut graph, &device),
        Err(RenderGraphError::InvalidState {
            expected: RenderGraphState::Compiled,
            actual: RenderGraphState::Executed,
        })
    ));
}

#[test]
fn test_load_chain_and_depth_input() {
    let (backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 128, 128);

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "opaque",
        |builder| {
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
            builder.set_depth_stencil_output("depth", AttachmentInfo::new(Format::D32Sfloat));
        },
        noop,
    );
    graph.add_gfx_pass(
        "transparent",
        |builder| {
            builder.add_color_input_output("backbuffer");
            builder.set_depth_stencil_input("depth");
        },
        noop,
    );
    graph.add_gfx_pass(
        "ui",
        |builder| {
            builder.add_color_input_output("backbuffer");
        },
        noop,
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 128, 128);

    compile(&mut graph, &device).unwrap();
    assert_eq!(graph.pass_list(), vec!["opaque", "transparent", "ui"]);

    let opaque = graph.barriers_for("opaque").unwrap();
    assert_eq!(opaque.len(), 1);
    assert_eq!(opaque[0].old_layout, TextureLayout::Undefined);
    assert_eq!(opaque[0].new_layout, TextureLayout::DepthStencilAttachment);

    let transparent = graph.barriers_for("transparent").unwrap();
    assert_eq!(transparent.len(), 1);
    assert_eq!(graph.attachment_name(transparent[0].resource), Some("depth"));
    assert_eq!(transparent[0].new_layout, TextureLayout::DepthStencilReadOnly);

    // backbuffer 的布局不由 barrier 管理
    assert!(graph.barriers_for("ui").unwrap().is_empty());

    let depth = graph.attachment("depth").unwrap();
    assert!(depth.is_depth());
    assert!(depth.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT));

    backend.clear_calls();
    execute(&mut graph, &device).unwrap();
    assert_eq!(backend.count_calls(|call| matches!(call, BackendCall::BeginRenderPass { .. })), 3);
    assert_eq!(
        backend.count_calls(|call| matches!(
            call,
            BackendCall::BeginRenderPass {
                depth_stencil_view: Some(_),
                ..
            }
        )),
        2
    );
}

#[test]
fn test_failed_pass_still_ends_render_pass() {
    let (backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);

    let mut graph = RenderGraph::new();
    graph.add_gfx_pass(
        "main",
        |builder| {
            builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
        },
        |_| Err(DeviceError::NotInRenderPass),
    );
    graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);
    compile(&mut graph, &device).unwrap();

    backend.clear_calls();
    assert!(matches!(
        execute(&mut graph, &device),
        Err(RenderGraphError::Device(DeviceError::NotInRenderPass))
    ));
    assert_eq!(backend.count_calls(|call| matches!(call, BackendCall::EndRenderPass(_))), 1);
}

#[test]
fn test_physical_reuse_across_frames() {
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 256, 256);
    let mut registry = PhysicalResourceRegistry::new();

    let mut physical = Vec::new();
    for _ in 0..4 {
        device.new_frame().unwrap();

        let mut graph = RenderGraph::new();
        graph.add_gfx_pass(
            "A",
            |builder| {
                builder.add_color_output("color", AttachmentInfo::new(COLOR));
            },
            noop,
        );
        graph.add_gfx_pass(
            "B",
            |builder| {
                builder.add_attachment_input("color");
                builder.add_color_output("backbuffer", AttachmentInfo::new(COLOR));
            },
            noop,
        );
        graph.set_backbuffer_attachment("backbuffer", backbuffer, 256, 256);
        graph.compile(&device, &mut registry).unwrap();
        physical.push(graph.physical_attachment("color").unwrap());

        let backbuffer_physical = graph.physical_attachment("backbuffer").unwrap();
        assert_eq!(backbuffer_physical.texture, None);
        assert_eq!(backbuffer_physical.view, backbuffer);
    }

    assert!(physical.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(registry.len(), 1);
    assert_eq!(device.texture_count(), 2);

    registry.clear(&device);
    assert!(registry.is_empty());
}

/// 测试用的 xorshift 随机数
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn chance(&mut self) -> bool {
        self.next() % 2 == 0
    }
}

#[test]
fn test_generated_graphs_respect_read_write_order() {
    const NAMES: [&str; 3] = ["a", "b", "c"];
    let (_backend, device) = new_device();
    let backbuffer = create_backbuffer(&device, 64, 64);
    let mut registry = PhysicalResourceRegistry::new();

    for seed in 1..=64u64 {
        let mut rng = XorShift(seed * 0x9E37_79B9_7F4A_7C15);

        // 每个 pass 读取若干已经被写过的名字，写入一个没有读取的名字
        let mut decls: Vec<(Vec<&str>, Option<&str>)> = Vec::new();
        for _ in 0..6 {
            let written = |name: &&str| decls.iter().any(|(_, write)| write.as_ref() == Some(name));
            let reads = NAMES.iter().copied().filter(|name| written(name)).filter(|_| rng.chance()).collect::<Vec<_>>();
            let candidates = NAMES.iter().copied().filter(|name| !reads.contains(name)).collect::<Vec<_>>();
            let write = candidates.get(rng.next() as usize % candidates.len().max(1)).copied();
            decls.push((reads, write));
        }
        let final_reads = NAMES
            .iter()
            .filter(|name| decls.iter().any(|(_, write)| write.as_ref() == Some(*name)))
            .copied()
            .collect::<Vec<_>>();
        decls.push((final_reads, Some("backbuffer")));

        let mut graph = RenderGraph::new();
        for (index, (reads, write)) in decls.iter().enumerate() {
            graph.add_gfx_pass(
                &format!("p{}", index),
                |builder| {
                    reads.iter().for_each(|name| {
                        builder.add_attachment_input(name);
                    });
                    if let Some(name) = write {
                        builder.add_color_output(name, AttachmentInfo::new(COLOR));
                    }
                },
                noop,
            );
        }
        graph.set_backbuffer_attachment("backbuffer", backbuffer, 64, 64);
        graph.compile(&device, &mut registry).unwrap();

        let order = graph.pass_list().iter().map(|name| name[1..].parse::<usize>().unwrap()).collect::<Vec<_>>();
        let position = |pass: usize| order.iter().position(|p| *p == pass);
        assert_eq!(order.last(), Some(&(decls.len() - 1)));

        for &pass in &order {
            let (reads, write) = &decls[pass];
            for name in reads {
                // 读到的是之前声明的最后一个写入者
                let producer = (0..pass).rev().find(|p| decls[*p].1 == Some(*name)).unwrap();
                assert!(position(producer).is_some_and(|p| p < position(pass).unwrap()), "seed {}", seed);
            }
            if let Some(name) = write {
                // 之前读取这个名字的 pass 要先执行
                for reader in (0..pass).filter(|p| decls[*p].0.contains(name)) {
                    if let Some(reader_position) = position(reader) {
                        assert!(reader_position < position(pass).unwrap(), "seed {}", seed);
                    }
                }
            }
        }
    }
    registry.clear(&device);
}
