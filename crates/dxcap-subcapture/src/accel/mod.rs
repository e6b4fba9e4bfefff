//! Dependency tracking of raytracing acceleration structures.
//!
//! Every build, update, copy or micromap build observed at execution time becomes a state. A
//! state writes one destination location and may read one source location (the structure an
//! update refits, or the structure a copy duplicates). The tracker keeps:
//!
//! - `by_location`: every live state that wrote a location, in id order. The last one is the
//!   location's current value.
//! - `source_by_dest` / `dests_by_source`: the edge from a state to the state it read.
//!
//! States are owned by one arena keyed by [`StateId`]; the indices only hold ids. Ids are
//! assigned on registration and never reused or renumbered, so a state's source always has a
//! smaller id and ascending id order is a valid replay order.
//!
//! Update chains are compressed when an intermediate update is removed: its dependents are
//! re-linked to the update's own source. An update rebuilds the structure from its full inputs,
//! so refitting from an older ancestor yields an equivalent structure.

mod desc;
mod restore;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

pub use desc::{
    AabbsDesc, AccelerationStructureLevel, BuildDesc, BuildFlags, BuildInputs, CopyMode,
    ElementsLayout, GeometryDesc, GpuAddressArg, InputRange, OmmArrayDesc, OmmInputs,
    TrianglesDesc, UncapturableInputs, INSTANCE_DESC_SIZE, TRANSFORM_SIZE,
};
pub use restore::RestoreSummary;

use crate::analysis::AnalyzerResults;
use crate::content::ContentId;
use crate::model::{CommandKey, KeyOffset, ObjectKey, ResourceRecord};
use crate::tiled::TiledResource;

pub type StateId = u64;

/// The call that produced a state, with every address argument resolved to a tracked location.
#[derive(Clone, Debug, PartialEq)]
pub enum AccelerationStructureOp {
    Build(BuildDesc),
    Copy {
        dest: GpuAddressArg,
        source: GpuAddressArg,
        mode: CopyMode,
    },
    NvApiBuild {
        desc: BuildDesc,
        ex_flags: u32,
    },
    NvApiOmmBuild(OmmArrayDesc),
}

impl AccelerationStructureOp {
    /// An in-place or out-of-place refit of an existing structure.
    pub fn is_update(&self) -> bool {
        match self {
            AccelerationStructureOp::Build(desc)
            | AccelerationStructureOp::NvApiBuild { desc, .. } => desc.inputs.is_update(),
            AccelerationStructureOp::Copy { .. } | AccelerationStructureOp::NvApiOmmBuild(_) => {
                false
            }
        }
    }

    pub fn level(&self) -> Option<AccelerationStructureLevel> {
        match self {
            AccelerationStructureOp::Build(desc)
            | AccelerationStructureOp::NvApiBuild { desc, .. } => Some(desc.inputs.level),
            AccelerationStructureOp::Copy { .. } | AccelerationStructureOp::NvApiOmmBuild(_) => {
                None
            }
        }
    }

    pub fn is_bottom_level(&self) -> bool {
        self.level() == Some(AccelerationStructureLevel::BottomLevel)
    }

    pub fn dest(&self) -> GpuAddressArg {
        match self {
            AccelerationStructureOp::Build(desc)
            | AccelerationStructureOp::NvApiBuild { desc, .. } => desc.dest,
            AccelerationStructureOp::Copy { dest, .. } => *dest,
            AccelerationStructureOp::NvApiOmmBuild(desc) => desc.dest,
        }
    }

    /// The structure this operation reads, if any.
    pub fn source(&self) -> Option<GpuAddressArg> {
        let source = match self {
            AccelerationStructureOp::Build(desc)
            | AccelerationStructureOp::NvApiBuild { desc, .. } => {
                if !desc.inputs.is_update() {
                    return None;
                }
                desc.source
            }
            AccelerationStructureOp::Copy { source, .. } => *source,
            AccelerationStructureOp::NvApiOmmBuild(_) => return None,
        };
        (!source.is_null()).then_some(source)
    }

    /// Buffer ranges the operation reads as geometry, instance or micromap inputs.
    pub fn input_ranges(&self) -> Result<Vec<InputRange>, UncapturableInputs> {
        match self {
            AccelerationStructureOp::Build(desc)
            | AccelerationStructureOp::NvApiBuild { desc, .. } => desc.inputs.input_ranges(),
            AccelerationStructureOp::Copy { .. } => Ok(Vec::new()),
            AccelerationStructureOp::NvApiOmmBuild(desc) => Ok(desc.inputs.input_ranges()),
        }
    }
}

/// An input buffer range as it was when the operation consumed it.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedInput {
    pub location: KeyOffset,
    pub size: u64,
    pub record: ResourceRecord,
    pub content: Option<ContentId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccelerationStructureState {
    /// Assigned by [`AccelerationStructureTracker::store_state`].
    pub id: StateId,
    pub command_key: CommandKey,
    pub command_list: ObjectKey,
    pub dest: KeyOffset,
    pub source: Option<KeyOffset>,
    pub op: AccelerationStructureOp,
    pub inputs: Vec<CapturedInput>,
    pub tiled_inputs: Vec<TiledResource>,
    pub scratch_size: u64,
    /// Bytes that have to go through the upload buffer when the state is replayed.
    pub restore_payload: u64,
}

impl AccelerationStructureState {
    pub fn new(
        command_key: CommandKey,
        command_list: ObjectKey,
        dest: KeyOffset,
        op: AccelerationStructureOp,
    ) -> Self {
        let source = op.source().and_then(|source| source.target);
        Self {
            id: 0,
            command_key,
            command_list,
            dest,
            source,
            op,
            inputs: Vec::new(),
            tiled_inputs: Vec::new(),
            scratch_size: 0,
            restore_payload: 0,
        }
    }

    /// Every resource the state needs alive to be replayed.
    pub fn referenced_resources(&self) -> BTreeSet<ObjectKey> {
        let mut keys: BTreeSet<ObjectKey> =
            self.inputs.iter().map(|input| input.location.key).collect();
        keys.insert(self.dest.key);
        keys.extend(self.source.map(|source| source.key));
        keys
    }

    /// Whether the offline analysis asks for this state.
    pub fn is_required(&self, analysis: &AnalyzerResults) -> bool {
        if analysis.lists_command_queue_command(self.command_key) {
            return true;
        }
        if self.op.is_bottom_level() {
            analysis.requires_acceleration_structure(self.dest)
        } else {
            analysis.lists_acceleration_structure(self.dest)
                || analysis.requires_object(self.dest.key)
        }
    }
}

#[derive(Debug, Default)]
pub struct AccelerationStructureTracker {
    states: BTreeMap<StateId, AccelerationStructureState>,
    by_location: BTreeMap<KeyOffset, BTreeSet<StateId>>,
    source_by_dest: BTreeMap<StateId, StateId>,
    dests_by_source: BTreeMap<StateId, BTreeSet<StateId>>,
    next_id: StateId,
    optimize: bool,
    /// States dropped since the last [`AccelerationStructureTracker::take_removed`].
    removed: Vec<AccelerationStructureState>,
}

impl AccelerationStructureTracker {
    pub fn new(optimize: bool) -> Self {
        Self {
            next_id: 1,
            optimize,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, id: StateId) -> Option<&AccelerationStructureState> {
        self.states.get(&id)
    }

    /// Live states in id order.
    pub fn states(&self) -> impl Iterator<Item = &AccelerationStructureState> {
        self.states.values()
    }

    pub fn ids(&self) -> Vec<StateId> {
        self.states.keys().copied().collect()
    }

    pub fn current_state(&self, location: KeyOffset) -> Option<StateId> {
        self.by_location
            .get(&location)
            .and_then(|ids| ids.last())
            .copied()
    }

    pub fn source_of(&self, id: StateId) -> Option<StateId> {
        self.source_by_dest.get(&id).copied()
    }

    pub fn dests_of(&self, id: StateId) -> BTreeSet<StateId> {
        self.dests_by_source.get(&id).cloned().unwrap_or_default()
    }

    fn dependent_count(&self, id: StateId) -> usize {
        self.dests_by_source.get(&id).map_or(0, BTreeSet::len)
    }

    fn is_current(&self, id: StateId) -> bool {
        self.states
            .get(&id)
            .is_some_and(|state| self.current_state(state.dest) == Some(id))
    }

    /// Registers a new state and makes it the current value of its destination.
    ///
    /// The state that previously held the destination is dropped when nothing depends on it;
    /// the drop cascades to its own source when that is left unreferenced and superseded.
    pub fn store_state(&mut self, mut state: AccelerationStructureState) -> StateId {
        let id = self.next_id;
        self.next_id += 1;
        state.id = id;

        let source = state.source.and_then(|location| self.current_state(location));
        if state.source.is_some() && source.is_none() {
            debug!(
                id,
                source = ?state.source,
                "source structure is not tracked; storing as a root"
            );
        }
        if let Some(source) = source {
            self.link(id, source);
        }

        let previous = self.current_state(state.dest);
        let dest = state.dest;
        self.states.insert(id, state);
        self.by_location.entry(dest).or_default().insert(id);

        if let Some(previous) = previous.filter(|&previous| self.dependent_count(previous) == 0) {
            self.remove_with(previous, &|tracker, source| !tracker.is_current(source));
        }
        debug!(id, %dest, source, "stored acceleration structure state");
        id
    }

    fn link(&mut self, dest: StateId, source: StateId) {
        self.source_by_dest.insert(dest, source);
        self.dests_by_source.entry(source).or_default().insert(dest);
    }

    fn unlink(&mut self, dest: StateId) -> Option<StateId> {
        let source = self.source_by_dest.remove(&dest)?;
        if let Some(dests) = self.dests_by_source.get_mut(&source) {
            dests.remove(&dest);
            if dests.is_empty() {
                self.dests_by_source.remove(&source);
            }
        }
        Some(source)
    }

    /// Drops a state. An update that still has dependents hands them over to its own source;
    /// any other state with dependents is kept. Returns whether the state was removed.
    ///
    /// The drop cascades to the source while the source is left without dependents and is no
    /// longer its location's current value.
    pub fn remove_state(&mut self, id: StateId) -> bool {
        self.remove_with(id, &|tracker, source| !tracker.is_current(source))
    }

    fn remove_with(&mut self, id: StateId, cascade: &dyn Fn(&Self, StateId) -> bool) -> bool {
        let mut next = Some(id);
        let mut removed_any = false;
        while let Some(id) = next.take() {
            let Some(source) = self.detach(id) else {
                break;
            };
            removed_any = true;
            next = source
                .filter(|&source| self.dependent_count(source) == 0 && cascade(self, source));
        }
        removed_any
    }

    /// Removes one state from the arena and every index. `None` when the state cannot be
    /// removed; otherwise the id of the source it had.
    fn detach(&mut self, id: StateId) -> Option<Option<StateId>> {
        let is_update = self.states.get(&id)?.op.is_update();
        let source = self.source_of(id);
        let dependents = self.dests_of(id);
        if !dependents.is_empty() {
            let Some(source) = source.filter(|_| is_update) else {
                return None;
            };
            for dependent in dependents {
                self.unlink(dependent);
                self.link(dependent, source);
                debug!(dependent, removed = id, source, "re-linked update chain");
            }
        }

        self.unlink(id);
        self.dests_by_source.remove(&id);
        let state = self.states.remove(&id)?;
        if let Some(ids) = self.by_location.get_mut(&state.dest) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_location.remove(&state.dest);
            }
        }
        debug!(id, dest = %state.dest, "removed acceleration structure state");
        self.removed.push(state);
        Some(source)
    }

    /// Prunes states nothing observable depends on. A no-op unless optimization is enabled.
    ///
    /// First splices out superseded updates whose dependents are all updates, then removes
    /// every state without dependents that `analysis` does not require.
    pub fn optimize(&mut self, analysis: &AnalyzerResults) -> usize {
        if !self.optimize {
            return 0;
        }
        let before = self.states.len();

        let spliceable: Vec<StateId> = self
            .states
            .values()
            .filter(|state| state.op.is_update() && !self.is_current(state.id))
            .filter(|state| {
                let dependents = self.dests_of(state.id);
                !dependents.is_empty()
                    && dependents.iter().all(|dependent| {
                        self.states
                            .get(dependent)
                            .is_some_and(|dependent| dependent.op.is_update())
                    })
            })
            .map(|state| state.id)
            .collect();
        for id in spliceable {
            self.remove_state(id);
        }

        let unrequired: Vec<StateId> = self
            .states
            .values()
            .filter(|state| self.dependent_count(state.id) == 0 && !state.is_required(analysis))
            .map(|state| state.id)
            .collect();
        for id in unrequired {
            if self.dependent_count(id) == 0 {
                self.remove_with(id, &|tracker, source| {
                    tracker
                        .states
                        .get(&source)
                        .is_some_and(|state| !state.is_required(analysis))
                });
            }
        }

        let removed = before - self.states.len();
        debug!(removed, remaining = self.states.len(), "optimized acceleration structures");
        removed
    }

    /// Hands out the states dropped since the last call so their pins and content references
    /// can be released.
    pub fn take_removed(&mut self) -> Vec<AccelerationStructureState> {
        std::mem::take(&mut self.removed)
    }

    /// Largest scratch requirement across live states.
    pub fn max_scratch_size(&self) -> u64 {
        self.states.values().map(|state| state.scratch_size).max().unwrap_or(0)
    }

    pub fn max_restore_payload(&self) -> u64 {
        self.states
            .values()
            .map(|state| state.restore_payload)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const R: ObjectKey = ObjectKey(10);

    fn at(key: ObjectKey, offset: u64) -> GpuAddressArg {
        GpuAddressArg::resolved(0x10_0000 * key.0 + offset, KeyOffset::new(key, offset))
    }

    fn build(dest: KeyOffset, command: u64) -> AccelerationStructureState {
        let desc = BuildDesc {
            dest: at(dest.key, dest.offset),
            inputs: BuildInputs::top_level(4, at(ObjectKey(1), 0)),
            source: GpuAddressArg::NULL,
            scratch: at(ObjectKey(2), 0),
        };
        AccelerationStructureState::new(
            CommandKey(command),
            ObjectKey(5),
            dest,
            AccelerationStructureOp::Build(desc),
        )
    }

    fn update(dest: KeyOffset, source: KeyOffset, command: u64) -> AccelerationStructureState {
        let desc = BuildDesc {
            dest: at(dest.key, dest.offset),
            inputs: BuildInputs::top_level(4, at(ObjectKey(1), 0))
                .with_flags(BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE),
            source: at(source.key, source.offset),
            scratch: at(ObjectKey(2), 0),
        };
        AccelerationStructureState::new(
            CommandKey(command),
            ObjectKey(5),
            dest,
            AccelerationStructureOp::Build(desc),
        )
    }

    fn copy(dest: KeyOffset, source: KeyOffset, command: u64) -> AccelerationStructureState {
        AccelerationStructureState::new(
            CommandKey(command),
            ObjectKey(5),
            dest,
            AccelerationStructureOp::Copy {
                dest: at(dest.key, dest.offset),
                source: at(source.key, source.offset),
                mode: CopyMode::Clone,
            },
        )
    }

    #[test]
    fn rebuilding_a_location_drops_the_unreferenced_previous_state() {
        let mut tracker = AccelerationStructureTracker::new(false);
        let location = KeyOffset::new(R, 0);
        let first = tracker.store_state(build(location, 1));
        let second = tracker.store_state(build(location, 2));

        assert_eq!(tracker.current_state(location), Some(second));
        assert!(tracker.get(first).is_none());
        assert_eq!(tracker.take_removed().len(), 1);
    }

    #[test]
    fn copied_structures_keep_their_source_alive() {
        let mut tracker = AccelerationStructureTracker::new(false);
        let original = KeyOffset::new(R, 0);
        let clone = KeyOffset::new(R, 256);
        let first = tracker.store_state(build(original, 1));
        let copied = tracker.store_state(copy(clone, original, 2));
        let rebuilt = tracker.store_state(build(original, 3));

        assert!(tracker.get(first).is_some());
        assert_eq!(tracker.source_of(copied), Some(first));
        assert_eq!(tracker.current_state(original), Some(rebuilt));

        // Replacing the copy leaves the superseded build without dependents.
        tracker.store_state(build(clone, 4));
        assert!(tracker.get(copied).is_none());
        assert!(tracker.get(first).is_none());
    }

    #[test]
    fn update_chains_are_recorded_edge_by_edge() {
        let mut tracker = AccelerationStructureTracker::new(true);
        let location = KeyOffset::new(R, 0);
        let b1 = tracker.store_state(build(location, 1));
        let u2 = tracker.store_state(update(location, location, 2));
        assert_eq!(tracker.dests_of(b1), BTreeSet::from([u2]));

        let u3 = tracker.store_state(update(location, location, 3));
        assert_eq!(tracker.current_state(location), Some(u3));
        assert_eq!(tracker.dests_of(u2), BTreeSet::from([u3]));

        assert!(tracker.remove_state(u2));
        assert_eq!(tracker.source_of(u3), Some(b1));
        assert_eq!(tracker.dests_of(b1), BTreeSet::from([u3]));
    }

    #[test]
    fn builds_with_dependents_cannot_be_removed() {
        let mut tracker = AccelerationStructureTracker::new(true);
        let location = KeyOffset::new(R, 0);
        let b1 = tracker.store_state(build(location, 1));
        tracker.store_state(copy(KeyOffset::new(R, 512), location, 2));

        assert!(!tracker.remove_state(b1));
        assert!(tracker.get(b1).is_some());
    }

    #[test]
    fn optimize_splices_superseded_updates() {
        let mut tracker = AccelerationStructureTracker::new(true);
        let location = KeyOffset::new(R, 0);
        let b1 = tracker.store_state(build(location, 1));
        let u2 = tracker.store_state(update(location, location, 2));
        let u3 = tracker.store_state(update(location, location, 3));

        tracker.optimize(&AnalyzerResults::absent());
        assert_eq!(tracker.ids(), vec![b1, u3]);
        assert_eq!(tracker.source_of(u3), Some(b1));
        assert!(tracker.get(u2).is_none());
    }

    #[test]
    fn optimize_is_a_no_op_when_disabled() {
        let mut tracker = AccelerationStructureTracker::new(false);
        let location = KeyOffset::new(R, 0);
        tracker.store_state(build(location, 1));
        tracker.store_state(update(location, location, 2));
        tracker.store_state(update(location, location, 3));
        let analysis = AnalyzerResults::parse("OBJECTS 99").unwrap();

        let before = tracker.ids();
        assert_eq!(tracker.optimize(&analysis), 0);
        assert_eq!(tracker.ids(), before);
    }

    #[test]
    fn optimize_prunes_structures_the_analysis_does_not_need() {
        let mut tracker = AccelerationStructureTracker::new(true);
        let kept = tracker.store_state(build(KeyOffset::new(ObjectKey(42), 0), 1));
        let dropped = tracker.store_state(build(KeyOffset::new(ObjectKey(43), 0), 2));
        let analysis = AnalyzerResults::parse("OBJECTS 42").unwrap();

        assert_eq!(tracker.optimize(&analysis), 1);
        assert!(tracker.get(kept).is_some());
        assert!(tracker.get(dropped).is_none());
    }
}
