use std::fs;

use dxcap::command::{Command, CommandListType};
use dxcap::descriptors::{DescriptorHandle, DescriptorHeapType, DescriptorRecord, ViewKind};
use dxcap::model::{HeapFlags, HeapType, ResourceDesc, ResourceStates};
use dxcap::{
    CommandKey, CommandRecord, HostMemoryGpu, InclusiveRange, MemorySink, ObjectKey,
    StateOrchestrator, SubcaptureConfig,
};
use pretty_assertions::assert_eq;

const DEVICE: ObjectKey = ObjectKey(1);
const QUEUE: ObjectKey = ObjectKey(2);
const UPLOAD: ObjectKey = ObjectKey(5);
const SCRATCH: ObjectKey = ObjectKey(6);
const FENCE: ObjectKey = ObjectKey(7);
const VIEWS: ObjectKey = ObjectKey(8);
const SWAP_CHAIN: ObjectKey = ObjectKey(9);

fn buffer(resource: ObjectKey, heap_type: HeapType, state: ResourceStates, va: u64) -> Command {
    Command::CreateCommittedResource {
        device: DEVICE,
        resource,
        heap_type,
        heap_flags: HeapFlags::empty(),
        desc: ResourceDesc::buffer(4096),
        initial_state: state,
        gpu_va: va,
        protected_session: None,
    }
}

fn script() -> Vec<Command> {
    vec![
        Command::CreateDevice {
            device: DEVICE,
            adapter: None,
        },
        Command::CreateCommandQueue {
            device: DEVICE,
            queue: QUEUE,
            list_type: CommandListType::Direct,
        },
        buffer(UPLOAD, HeapType::Upload, ResourceStates::GENERIC_READ, 0x1_0000),
        buffer(SCRATCH, HeapType::Default, ResourceStates::COMMON, 0x2_0000),
        Command::CreateFence {
            device: DEVICE,
            fence: FENCE,
            initial_value: 0,
        },
        Command::CreateDescriptorHeap {
            device: DEVICE,
            heap: VIEWS,
            heap_type: DescriptorHeapType::CbvSrvUav,
            capacity: 4,
            shader_visible: false,
        },
        Command::CreateView {
            device: DEVICE,
            view: DescriptorRecord::new(ViewKind::ShaderResource, Some(UPLOAD), None),
            dest: DescriptorHandle::new(VIEWS, 0),
        },
        Command::CreateView {
            device: DEVICE,
            view: DescriptorRecord::new(ViewKind::UnorderedAccess, Some(SCRATCH), None),
            dest: DescriptorHandle::new(VIEWS, 1),
        },
        Command::MakeResident {
            device: DEVICE,
            objects: vec![UPLOAD],
        },
        Command::MakeResident {
            device: DEVICE,
            objects: vec![UPLOAD],
        },
        Command::QueueSignal {
            queue: QUEUE,
            fence: FENCE,
            value: 3,
        },
        Command::Present {
            swap_chain: SWAP_CHAIN,
            sync_interval: 1,
            flags: 0,
        },
        // First call of frame 2.
        Command::QueueSignal {
            queue: QUEUE,
            fence: FENCE,
            value: 4,
        },
    ]
}

fn position(commands: &[Command], wanted: impl Fn(&Command) -> bool) -> usize {
    commands
        .iter()
        .position(wanted)
        .unwrap_or_else(|| panic!("command not found in {commands:#?}"))
}

#[test]
fn analysis_narrows_the_restored_session() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let config = SubcaptureConfig {
        stream_dir: dir.path().join("capture"),
        frames: InclusiveRange::single(2),
        use_analysis: true,
        ..SubcaptureConfig::default()
    };
    fs::create_dir_all(&config.stream_dir).unwrap();
    fs::write(config.analysis_path(), "OBJECTS\n1 2 5 7 8\n").unwrap();

    let gpu = HostMemoryGpu::new().with_zero_fill_unknown();
    let mut orchestrator = StateOrchestrator::new(&config, gpu, MemorySink::new()).unwrap();
    for (key, command) in (1u64..).zip(script()) {
        orchestrator
            .process(CommandRecord::new(CommandKey(key), command))
            .unwrap();
    }

    let report = *orchestrator.report().unwrap();
    assert_eq!(report.objects, 5);
    assert_eq!(report.fences, 1);
    assert_eq!(report.mappable_resources, 1);
    assert_eq!(report.descriptors, 1);
    assert_eq!(report.residency_calls, 2);

    let records = orchestrator.into_sink().into_records();
    let commands: Vec<Command> = records.iter().map(|record| record.command.clone()).collect();

    assert!(!commands.iter().any(|command| matches!(
        command,
        Command::CreateCommittedResource {
            resource: SCRATCH,
            ..
        }
    )));

    let fence_value = position(&commands, |command| {
        matches!(command, Command::FenceSignal { fence: FENCE, value: 3 })
    });
    let content = position(&commands, |command| {
        matches!(command, Command::Unmap { resource: UPLOAD, .. })
    });
    let view = position(&commands, |command| matches!(command, Command::CreateView { .. }));
    let resident = position(&commands, |command| matches!(command, Command::MakeResident { .. }));
    assert!(fence_value < content);
    assert!(content < view);
    assert!(view < resident);

    let unmap = records
        .iter()
        .find(|record| matches!(record.command, Command::Unmap { resource: UPLOAD, .. }))
        .unwrap();
    assert_eq!(unmap.mapped_data.as_ref().unwrap().bytes.len(), 4096);

    // The triggering call is forwarded after the restore, with its original key.
    let last = records.last().unwrap();
    assert_eq!(last.key, CommandKey(13));
    assert!(records[..records.len() - 1]
        .iter()
        .all(|record| record.key.is_restore()));

    let json = serde_json::to_value(report).unwrap();
    assert_eq!(json["objects"], 5);
}
