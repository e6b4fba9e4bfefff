//! Folds the observed `MakeResident`/`Evict` history into the calls that reproduce it.
//!
//! Residency is reference counted by the driver: an object created resident starts at one, an
//! object created with `CREATE_NOT_RESIDENT` at zero, and every make-resident or evict moves the
//! count by one. Restore recreates objects in their creation residency, so only the difference
//! has to be replayed.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::command::Command;
use crate::model::ObjectKey;
use crate::stream::RestoreStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidencyInfo {
    pub count: i64,
    pub device: ObjectKey,
    pub created_not_resident: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidencyAction {
    MakeResident { repeat: u32 },
    Evict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidencyCall {
    pub object: ObjectKey,
    pub device: ObjectKey,
    pub action: ResidencyAction,
}

#[derive(Debug, Default)]
pub struct ResidencyReconciler {
    objects: BTreeMap<ObjectKey, ResidencyInfo>,
}

impl ResidencyReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a make-resident (`delta > 0`) or evict (`delta < 0`) of every key.
    pub fn observe(&mut self, keys: &[ObjectKey], delta: i64, device: ObjectKey) {
        for &key in keys {
            let info = self.objects.entry(key).or_insert(ResidencyInfo {
                count: 1,
                device,
                created_not_resident: false,
            });
            info.count += delta;
            info.device = device;
            debug!(%key, count = info.count, "residency changed");
        }
    }

    /// Marks an object created with `CREATE_NOT_RESIDENT`. Must precede any [`observe`] of it.
    ///
    /// [`observe`]: ResidencyReconciler::observe
    pub fn created_not_resident(&mut self, key: ObjectKey, device: ObjectKey) {
        self.objects.insert(
            key,
            ResidencyInfo {
                count: 0,
                device,
                created_not_resident: true,
            },
        );
    }

    pub fn forget(&mut self, key: ObjectKey) {
        self.objects.remove(&key);
    }

    pub fn get(&self, key: ObjectKey) -> Option<&ResidencyInfo> {
        self.objects.get(&key)
    }

    /// Calls that move every recreated object from its creation residency to its final one.
    pub fn plan(&self) -> Vec<ResidencyCall> {
        self.objects
            .iter()
            .filter_map(|(&object, info)| {
                let action = if info.created_not_resident {
                    (info.count >= 1).then(|| ResidencyAction::MakeResident {
                        repeat: info.count as u32,
                    })
                } else if info.count >= 2 {
                    Some(ResidencyAction::MakeResident {
                        repeat: (info.count - 1) as u32,
                    })
                } else if info.count <= 0 {
                    Some(ResidencyAction::Evict)
                } else {
                    None
                }?;
                Some(ResidencyCall {
                    object,
                    device: info.device,
                    action,
                })
            })
            .collect()
    }

    /// Emits the planned calls for every restored object. Returns the number of calls.
    pub fn restore(
        &self,
        is_restored: impl Fn(ObjectKey) -> bool,
        stream: &mut RestoreStream<'_>,
    ) -> usize {
        let mut emitted = 0;
        for call in self.plan() {
            if !is_restored(call.object) {
                continue;
            }
            match call.action {
                ResidencyAction::MakeResident { repeat } => {
                    for _ in 0..repeat {
                        stream.emit(Command::MakeResident {
                            device: call.device,
                            objects: vec![call.object],
                        });
                        emitted += 1;
                    }
                }
                ResidencyAction::Evict => {
                    stream.emit(Command::Evict {
                        device: call.device,
                        objects: vec![call.object],
                    });
                    emitted += 1;
                }
            }
        }
        info!(calls = emitted, "residency restored");
        emitted
    }
}
