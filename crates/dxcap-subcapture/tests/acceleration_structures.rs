use std::collections::{BTreeMap, BTreeSet};

use dxcap_subcapture::accel::{
    AccelerationStructureOp, AccelerationStructureState, AccelerationStructureTracker, BuildDesc,
    BuildFlags, BuildInputs, CopyMode, GpuAddressArg, StateId,
};
use dxcap_subcapture::model::{CommandKey, KeyOffset, ObjectKey};
use dxcap_subcapture::AnalyzerResults;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const LIST: ObjectKey = ObjectKey(5);

fn address(location: KeyOffset) -> GpuAddressArg {
    GpuAddressArg::resolved(0x100_0000 * location.key.0 + location.offset, location)
}

fn instances() -> GpuAddressArg {
    address(KeyOffset::new(ObjectKey(1), 0))
}

fn build(dest: KeyOffset, command: u64) -> AccelerationStructureState {
    AccelerationStructureState::new(
        CommandKey(command),
        LIST,
        dest,
        AccelerationStructureOp::Build(BuildDesc {
            dest: address(dest),
            inputs: BuildInputs::top_level(2, instances()).with_flags(BuildFlags::ALLOW_UPDATE),
            source: GpuAddressArg::NULL,
            scratch: GpuAddressArg::NULL,
        }),
    )
}

fn update(dest: KeyOffset, source: KeyOffset, command: u64) -> AccelerationStructureState {
    AccelerationStructureState::new(
        CommandKey(command),
        LIST,
        dest,
        AccelerationStructureOp::Build(BuildDesc {
            dest: address(dest),
            inputs: BuildInputs::top_level(2, instances())
                .with_flags(BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE),
            source: address(source),
            scratch: GpuAddressArg::NULL,
        }),
    )
}

fn clone(dest: KeyOffset, source: KeyOffset, command: u64) -> AccelerationStructureState {
    AccelerationStructureState::new(
        CommandKey(command),
        LIST,
        dest,
        AccelerationStructureOp::Copy {
            dest: address(dest),
            source: address(source),
            mode: CopyMode::Clone,
        },
    )
}

#[test]
fn update_chain_end_to_end() {
    let r = KeyOffset::new(ObjectKey(10), 0);
    let mut tracker = AccelerationStructureTracker::new(true);

    let b1 = tracker.store_state(build(r, 1));
    let u2 = tracker.store_state(update(r, r, 2));
    assert_eq!(tracker.dests_of(b1), BTreeSet::from([u2]));

    let u3 = tracker.store_state(update(r, r, 3));
    assert_eq!(tracker.current_state(r), Some(u3));
    assert_eq!(tracker.dests_of(u2), BTreeSet::from([u3]));
    assert_eq!(tracker.len(), 3);

    assert!(tracker.remove_state(u2));
    assert_eq!(tracker.source_of(u3), Some(b1));
    assert_eq!(tracker.dests_of(b1), BTreeSet::from([u3]));
    assert_eq!(tracker.current_state(r), Some(u3));
    assert!(tracker.get(u2).is_none());
}

#[test]
fn removed_root_update_never_leaves_a_dangling_source() {
    let d = KeyOffset::new(ObjectKey(11), 0);
    let mut tracker = AccelerationStructureTracker::new(false);
    let root = tracker.store_state(build(d, 1));
    let u1 = tracker.store_state(update(d, d, 2));
    let u2 = tracker.store_state(update(d, d, 3));

    tracker.remove_state(u1);
    let source = tracker.source_of(u2).unwrap();
    assert_eq!(source, root);
    assert!(tracker.get(source).is_some());
}

#[test]
fn listed_structure_survives_optimization() {
    let analysis = AnalyzerResults::parse("OBJECTS\n7\nACCELERATION_STRUCTURES\n42 0\n").unwrap();
    let listed = KeyOffset::new(ObjectKey(42), 0);
    let unlisted = KeyOffset::new(ObjectKey(43), 0);

    let mut tracker = AccelerationStructureTracker::new(true);
    let kept = tracker.store_state(build(listed, 1));
    let pruned = tracker.store_state(build(unlisted, 2));

    // Neither destination object is listed; only the location 42@0 is.
    let removed = tracker.optimize(&analysis);
    assert_eq!(removed, 1);
    assert_eq!(tracker.ids(), vec![kept]);
    assert!(tracker.get(pruned).is_none());
    assert_eq!(tracker.take_removed().len(), 1);
}

#[test]
fn disabled_optimization_keeps_every_state() {
    let analysis = AnalyzerResults::parse("OBJECTS\n1\nACCELERATION_STRUCTURES\n1 0\n").unwrap();
    let r = KeyOffset::new(ObjectKey(10), 0);
    let mut tracker = AccelerationStructureTracker::new(false);
    tracker.store_state(build(r, 1));
    tracker.store_state(update(r, r, 2));
    tracker.store_state(clone(KeyOffset::new(ObjectKey(12), 0), r, 3));

    let before: Vec<_> = tracker.states().cloned().collect();
    assert_eq!(tracker.optimize(&analysis), 0);
    let after: Vec<_> = tracker.states().cloned().collect();
    assert_eq!(before, after);
}

#[derive(Clone, Debug)]
enum Op {
    Build(u64),
    Update(u64, u64),
    Clone(u64, u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4u64).prop_map(Op::Build),
        (0..4u64, 0..4u64).prop_map(|(dest, source)| Op::Update(dest, source)),
        (0..4u64, 0..4u64).prop_map(|(dest, source)| Op::Clone(dest, source)),
    ]
}

fn location(slot: u64) -> KeyOffset {
    KeyOffset::new(ObjectKey(20 + slot / 2), (slot % 2) * 4096)
}

proptest! {
    #[test]
    fn current_state_is_the_latest_store(ops in proptest::collection::vec(op(), 1..40)) {
        let mut tracker = AccelerationStructureTracker::new(false);
        let mut latest: BTreeMap<KeyOffset, StateId> = BTreeMap::new();

        for (command, op) in (1u64..).zip(ops) {
            let state = match op {
                Op::Build(dest) => build(location(dest), command),
                Op::Update(dest, source) => update(location(dest), location(source), command),
                Op::Clone(dest, source) => clone(location(dest), location(source), command),
            };
            let dest = state.dest;
            let id = tracker.store_state(state);
            latest.insert(dest, id);

            for (&location, &id) in &latest {
                prop_assert_eq!(tracker.current_state(location), Some(id));
            }
            for state in tracker.states() {
                if let Some(source) = tracker.source_of(state.id) {
                    prop_assert!(tracker.get(source).is_some());
                    prop_assert!(source < state.id);
                }
            }
        }
    }
}
