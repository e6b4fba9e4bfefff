use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::{KeyOffset, ObjectKey, ObjectKind, ObjectPayload, ResourceRecord, TrackedObject};
use crate::error::{Result, SubcaptureError};

/// Result of dropping one application reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references remain.
    Alive(u32),
    /// The object is destroyed but pinned as a restore dependency.
    Retained,
    /// The object is gone from the registry.
    Removed,
}

/// Owning table of every tracked object, plus the GPU virtual address index.
///
/// Objects are keyed by their capture key and iterated in key order, which is also creation
/// order: a parent is always created (and therefore restored) before its children.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectKey, TrackedObject>,
    pins: HashMap<ObjectKey, u32>,
    /// start address -> (resource, size)
    addresses: BTreeMap<u64, (ObjectKey, u64)>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn insert(&mut self, object: TrackedObject) -> Result<()> {
        if self.objects.contains_key(&object.key) {
            return Err(SubcaptureError::DuplicateObject(object.key));
        }
        if let Some(parent) = object.parent {
            if let Some(parent) = self.objects.get_mut(&parent) {
                parent.children.insert(object.key);
            }
        }
        if let ObjectPayload::Resource(record) = &object.payload {
            let size = record.address_range_size();
            if record.gpu_va != 0 && size != 0 {
                // Placed resources may alias an address range; the most recent one wins.
                self.addresses.insert(record.gpu_va, (object.key, size));
            }
        }
        debug!(key = %object.key, kind = ?object.kind, "tracking object");
        self.objects.insert(object.key, object);
        Ok(())
    }

    pub fn get(&self, key: ObjectKey) -> Option<&TrackedObject> {
        self.objects.get(&key)
    }

    pub fn get_mut(&mut self, key: ObjectKey) -> Option<&mut TrackedObject> {
        self.objects.get_mut(&key)
    }

    pub fn require(&self, key: ObjectKey) -> Result<&TrackedObject> {
        self.objects
            .get(&key)
            .ok_or(SubcaptureError::UnknownObject(key))
    }

    pub fn require_mut(&mut self, key: ObjectKey) -> Result<&mut TrackedObject> {
        self.objects
            .get_mut(&key)
            .ok_or(SubcaptureError::UnknownObject(key))
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.objects.contains_key(&key)
    }

    pub fn resource(&self, key: ObjectKey) -> Result<&ResourceRecord> {
        let object = self.require(key)?;
        object.resource().ok_or(SubcaptureError::WrongKind {
            key,
            found: object.kind,
            expected: "resource",
        })
    }

    pub fn kind(&self, key: ObjectKey) -> Option<ObjectKind> {
        self.objects.get(&key).map(|object| object.kind)
    }

    /// Objects that a restore must recreate, in creation order.
    pub fn restorable(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values().filter(|object| object.is_restorable())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn add_ref(&mut self, key: ObjectKey) -> Result<u32> {
        let object = self.require_mut(key)?;
        object.ref_count += 1;
        Ok(object.ref_count)
    }

    pub fn release(&mut self, key: ObjectKey) -> Result<ReleaseOutcome> {
        let object = self.require_mut(key)?;
        if object.destroyed {
            return Err(SubcaptureError::ReleaseUnderflow(key));
        }
        object.ref_count = object
            .ref_count
            .checked_sub(1)
            .ok_or(SubcaptureError::ReleaseUnderflow(key))?;
        if object.ref_count > 0 {
            return Ok(ReleaseOutcome::Alive(object.ref_count));
        }

        object.destroyed = true;
        if self.is_pinned(key) {
            if let Some(object) = self.objects.get_mut(&key) {
                object.keep_destroyed = true;
            }
            debug!(%key, "object destroyed but retained as a dependency");
            return Ok(ReleaseOutcome::Retained);
        }
        self.purge(key);
        Ok(ReleaseOutcome::Removed)
    }

    pub fn is_pinned(&self, key: ObjectKey) -> bool {
        self.pins.get(&key).is_some_and(|&count| count > 0)
    }

    /// Marks `key` as a dependency of some restorable state.
    pub fn pin(&mut self, key: ObjectKey) {
        *self.pins.entry(key).or_insert(0) += 1;
    }

    /// Drops one dependency pin. Returns `true` when this purged a destroyed object.
    pub fn unpin(&mut self, key: ObjectKey) -> bool {
        let Some(count) = self.pins.get_mut(&key) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }
        self.pins.remove(&key);

        let destroyed = self.objects.get(&key).is_some_and(|object| object.destroyed);
        if destroyed {
            self.purge(key);
        }
        destroyed
    }

    fn purge(&mut self, key: ObjectKey) {
        let Some(object) = self.objects.remove(&key) else {
            return;
        };
        if let Some(parent) = object.parent.and_then(|parent| self.objects.get_mut(&parent)) {
            parent.children.remove(&key);
        }
        if let ObjectPayload::Resource(record) = &object.payload {
            if self
                .addresses
                .get(&record.gpu_va)
                .is_some_and(|(owner, _)| *owner == key)
            {
                self.addresses.remove(&record.gpu_va);
            }
        }
        debug!(%key, kind = ?object.kind, "object purged");
    }

    /// Maps a GPU virtual address back to the resource containing it.
    pub fn resolve_address(&self, address: u64) -> Option<KeyOffset> {
        let (&start, &(key, size)) = self.addresses.range(..=address).next_back()?;
        let offset = address - start;
        (offset < size).then_some(KeyOffset { key, offset })
    }

    /// Every ancestor of `key`, nearest first.
    pub fn ancestors(&self, key: ObjectKey) -> Vec<ObjectKey> {
        let mut out = Vec::new();
        let mut cursor = self.objects.get(&key).and_then(|object| object.parent);
        while let Some(parent) = cursor {
            if out.contains(&parent) {
                break;
            }
            out.push(parent);
            cursor = self.objects.get(&parent).and_then(|object| object.parent);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HeapType, ResourceDesc, ResourceStates};

    fn buffer(key: u64, gpu_va: u64, size: u64) -> TrackedObject {
        let record = ResourceRecord::new(
            ResourceDesc::buffer(size),
            HeapType::Default,
            ResourceStates::COMMON,
        )
        .with_gpu_va(gpu_va);
        TrackedObject::new(ObjectKey(key), ObjectKind::CommittedResource)
            .with_payload(ObjectPayload::Resource(record))
    }

    #[test]
    fn resolves_addresses_inside_buffers_only() {
        let mut registry = ObjectRegistry::new();
        registry.insert(buffer(1, 0x1_0000, 0x1000)).unwrap();
        registry.insert(buffer(2, 0x2_0000, 0x100)).unwrap();

        assert_eq!(
            registry.resolve_address(0x1_0800),
            Some(KeyOffset::new(ObjectKey(1), 0x800))
        );
        assert_eq!(
            registry.resolve_address(0x2_0000),
            Some(KeyOffset::new(ObjectKey(2), 0))
        );
        assert_eq!(registry.resolve_address(0x1_1000), None);
        assert_eq!(registry.resolve_address(0x10), None);
    }

    #[test]
    fn pinned_objects_survive_release_until_unpinned() {
        let mut registry = ObjectRegistry::new();
        registry.insert(buffer(1, 0x1_0000, 0x1000)).unwrap();
        registry.pin(ObjectKey(1));

        assert_eq!(registry.release(ObjectKey(1)).unwrap(), ReleaseOutcome::Retained);
        let object = registry.get(ObjectKey(1)).unwrap();
        assert!(object.destroyed && object.keep_destroyed);
        assert!(object.is_restorable());
        assert!(registry.resolve_address(0x1_0000).is_some());

        assert!(registry.unpin(ObjectKey(1)));
        assert!(registry.get(ObjectKey(1)).is_none());
        assert_eq!(registry.resolve_address(0x1_0000), None);
    }

    #[test]
    fn release_counts_references() {
        let mut registry = ObjectRegistry::new();
        registry
            .insert(TrackedObject::new(ObjectKey(5), ObjectKind::Fence))
            .unwrap();
        assert_eq!(registry.add_ref(ObjectKey(5)).unwrap(), 2);
        assert_eq!(registry.release(ObjectKey(5)).unwrap(), ReleaseOutcome::Alive(1));
        assert_eq!(registry.release(ObjectKey(5)).unwrap(), ReleaseOutcome::Removed);
        assert!(matches!(
            registry.release(ObjectKey(5)),
            Err(SubcaptureError::UnknownObject(_))
        ));
    }

    #[test]
    fn children_are_linked_to_parents() {
        let mut registry = ObjectRegistry::new();
        registry
            .insert(TrackedObject::new(ObjectKey(1), ObjectKind::Device))
            .unwrap();
        registry
            .insert(
                TrackedObject::new(ObjectKey(2), ObjectKind::Heap).with_parent(Some(ObjectKey(1))),
            )
            .unwrap();
        registry
            .insert(
                TrackedObject::new(ObjectKey(3), ObjectKind::PlacedResource)
                    .with_parent(Some(ObjectKey(2))),
            )
            .unwrap();

        assert!(registry.get(ObjectKey(1)).unwrap().children.contains(&ObjectKey(2)));
        assert_eq!(registry.ancestors(ObjectKey(3)), vec![ObjectKey(2), ObjectKey(1)]);
    }
}
