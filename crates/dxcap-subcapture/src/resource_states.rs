//! Per-subresource GPU state ledger fed by executed barriers.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::command::{Command, ResourceBarrier, ALL_SUBRESOURCES};
use crate::error::{Result, SubcaptureError};
use crate::model::{ObjectKey, ResourceRecord, ResourceStates};
use crate::stream::{RestoreQueue, RestoreStream};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubresourceStates {
    AllEqual(ResourceStates),
    PerSubresource(Vec<ResourceStates>),
}

/// How restore treats a resource's final state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateClass {
    /// Created in (or rewritten to) `COPY_DEST` on restore.
    Tracked,
    /// Swap chain buffers start out in `PRESENT`.
    BackBuffer,
    /// Upload-heap and acceleration structure storage never leave their creation state.
    Fixed,
}

impl StateClass {
    pub fn of(record: &ResourceRecord) -> Self {
        if record.back_buffer {
            StateClass::BackBuffer
        } else if record.generic_read || record.is_acceleration_structure_storage() {
            StateClass::Fixed
        } else {
            StateClass::Tracked
        }
    }

    /// State the resource is in right after the object and content restore.
    pub fn baseline(self) -> Option<ResourceStates> {
        match self {
            StateClass::Tracked => Some(ResourceStates::COPY_DEST),
            StateClass::BackBuffer => Some(ResourceStates::PRESENT),
            StateClass::Fixed => None,
        }
    }
}

#[derive(Clone, Debug)]
struct LedgerEntry {
    states: SubresourceStates,
    subresource_count: u32,
    class: StateClass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AliasingEntry {
    before: Option<ObjectKey>,
    after: Option<ObjectKey>,
    /// How many times this pair had been seen, including this entry.
    occurrence: u32,
}

#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    entries: BTreeMap<ObjectKey, LedgerEntry>,
    aliasing_log: Vec<AliasingEntry>,
    aliasing_counts: HashMap<(Option<ObjectKey>, Option<ObjectKey>), u32>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_creation(
        &mut self,
        key: ObjectKey,
        initial_state: ResourceStates,
        subresource_count: u32,
        class: StateClass,
    ) {
        self.entries.insert(
            key,
            LedgerEntry {
                states: SubresourceStates::AllEqual(initial_state),
                subresource_count: subresource_count.max(1),
                class,
            },
        );
    }

    pub fn record_barrier(
        &mut self,
        key: ObjectKey,
        subresource: u32,
        state: ResourceStates,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(SubcaptureError::UnknownObject(key))?;

        if subresource == ALL_SUBRESOURCES {
            entry.states = SubresourceStates::AllEqual(state);
            return Ok(());
        }
        if subresource >= entry.subresource_count {
            return Err(SubcaptureError::SubresourceOutOfRange {
                key,
                subresource,
                count: entry.subresource_count,
            });
        }

        let mut states = match &entry.states {
            SubresourceStates::AllEqual(all) => vec![*all; entry.subresource_count as usize],
            SubresourceStates::PerSubresource(states) => states.clone(),
        };
        states[subresource as usize] = state;
        entry.states = if states.iter().all(|s| *s == states[0]) {
            SubresourceStates::AllEqual(states[0])
        } else {
            SubresourceStates::PerSubresource(states)
        };
        Ok(())
    }

    pub fn record_aliasing_barrier(&mut self, before: Option<ObjectKey>, after: Option<ObjectKey>) {
        let count = self.aliasing_counts.entry((before, after)).or_insert(0);
        *count += 1;
        self.aliasing_log.push(AliasingEntry {
            before,
            after,
            occurrence: *count,
        });
    }

    /// Applies the barriers of an executed command list.
    pub fn apply(&mut self, barriers: &[ResourceBarrier]) -> Result<()> {
        for barrier in barriers {
            match *barrier {
                ResourceBarrier::Transition {
                    resource,
                    subresource,
                    after,
                    ..
                } => self.record_barrier(resource, subresource, after)?,
                ResourceBarrier::Aliasing { before, after } => {
                    self.record_aliasing_barrier(before, after)
                }
                ResourceBarrier::Uav { .. } => {}
            }
        }
        Ok(())
    }

    pub fn forget(&mut self, key: ObjectKey) {
        self.entries.remove(&key);
    }

    pub fn states(&self, key: ObjectKey) -> Option<&SubresourceStates> {
        self.entries.get(&key).map(|entry| &entry.states)
    }

    pub fn state(&self, key: ObjectKey, subresource: u32) -> Option<ResourceStates> {
        match &self.entries.get(&key)?.states {
            SubresourceStates::AllEqual(state) => Some(*state),
            SubresourceStates::PerSubresource(states) => states.get(subresource as usize).copied(),
        }
    }

    fn transitions(
        &self,
        class: StateClass,
        is_restored: &dyn Fn(ObjectKey) -> bool,
    ) -> Vec<ResourceBarrier> {
        let Some(baseline) = class.baseline() else {
            return Vec::new();
        };
        let mut barriers = Vec::new();
        for (&key, entry) in &self.entries {
            if entry.class != class || !is_restored(key) {
                continue;
            }
            match &entry.states {
                SubresourceStates::AllEqual(state) => {
                    if *state != baseline {
                        barriers.push(ResourceBarrier::transition(key, baseline, *state));
                    }
                }
                SubresourceStates::PerSubresource(states) => {
                    for (subresource, state) in (0u32..).zip(states) {
                        if *state != baseline {
                            barriers.push(ResourceBarrier::Transition {
                                resource: key,
                                subresource,
                                before: baseline,
                                after: *state,
                            });
                        }
                    }
                }
            }
        }
        barriers
    }

    /// Aliasing barriers to replay: for each `(before, after)` pair only the log entry whose
    /// occurrence number equals the pair's final count, in log order.
    fn aliasing_barriers(&self, is_restored: &dyn Fn(ObjectKey) -> bool) -> Vec<ResourceBarrier> {
        let present = |key: Option<ObjectKey>| key.map_or(true, is_restored);
        self.aliasing_log
            .iter()
            .filter(|entry| {
                self.aliasing_counts.get(&(entry.before, entry.after)) == Some(&entry.occurrence)
            })
            .filter(|entry| present(entry.before) && present(entry.after))
            .map(|entry| ResourceBarrier::Aliasing {
                before: entry.before,
                after: entry.after,
            })
            .collect()
    }

    /// Moves every restored resource from its restore baseline to its tracked state.
    ///
    /// Returns the number of barriers emitted.
    pub fn restore(
        &self,
        is_restored: impl Fn(ObjectKey) -> bool,
        queue: &mut RestoreQueue,
        stream: &mut RestoreStream<'_>,
    ) -> usize {
        let mut barriers = self.transitions(StateClass::Tracked, &is_restored);
        barriers.extend(self.aliasing_barriers(&is_restored));
        let back_buffers = self.transitions(StateClass::BackBuffer, &is_restored);

        let emitted = barriers.len() + back_buffers.len();
        for batch in [barriers, back_buffers] {
            if batch.is_empty() {
                continue;
            }
            debug!(count = batch.len(), "restoring resource states");
            queue.record(
                stream,
                Command::ResourceBarrier {
                    list: queue.list,
                    barriers: batch,
                },
            );
        }
        if emitted > 0 {
            queue.submit_and_wait(stream);
        }
        info!(barriers = emitted, "resource states restored");
        emitted
    }
}
