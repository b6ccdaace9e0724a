// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::Error;
use crate::event::{Change, MutationEvent};
use crate::slots::{SlotId, SlotList};
use fusion_transport::{ClusterInfo, Key, Mutation, StructureId, StructureKind, Value};

// Logical view of the structure. Values live in the compaction list; the layout only holds handles.
#[derive(Debug)]
enum Layout {
    List(Vec<SlotId>),
    Map(BTreeMap<Key, SlotId>),
    Queue(VecDeque<SlotId>),
}

/// The live data of one primary structure.
///
/// Next to its logical layout the store keeps every value in a compaction list: the slot at
/// depth `k` is backed by stripe `k` on the backups. Removing a value moves the deepest slot into
/// the freed one, so depths stay dense no matter where the removal happens.
#[derive(Debug)]
pub struct PrimaryStore {
    structure_id: StructureId,
    cluster: ClusterInfo,
    slots: SlotList<Value>,
    layout: Layout,
}

impl PrimaryStore {
    pub fn new(structure_id: impl Into<StructureId>, kind: StructureKind, cluster: ClusterInfo) -> Self {
        let layout = match kind {
            StructureKind::List => Layout::List(Vec::new()),
            StructureKind::Map => Layout::Map(BTreeMap::new()),
            StructureKind::Queue => Layout::Queue(VecDeque::new()),
        };
        Self {
            structure_id: structure_id.into(),
            cluster,
            slots: SlotList::new(),
            layout,
        }
    }

    pub fn structure_id(&self) -> &str {
        &self.structure_id
    }

    pub fn kind(&self) -> StructureKind {
        match self.layout {
            Layout::List(_) => StructureKind::List,
            Layout::Map(_) => StructureKind::Map,
            Layout::Queue(_) => StructureKind::Queue,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Applies a client mutation.
    pub fn apply(&mut self, mutation: Mutation) -> Result<MutationEvent, Error> {
        match (mutation, self.kind()) {
            (Mutation::Add { key, value }, StructureKind::List) => self.insert(key, value),
            (Mutation::Add { key, value }, StructureKind::Map) => self.set(key, value),
            (Mutation::Append { value }, StructureKind::List) => self.append(value),
            (Mutation::Append { value }, StructureKind::Queue) => self.enqueue(value),
            (Mutation::Remove { key }, _) => self.remove(key),
            (mutation, kind) => Err(self.unsupported(&format!("{:?}", mutation), kind)),
        }
    }

    /// Inserts `value` at position `index` of a list, shifting later positions up.
    pub fn insert(&mut self, index: Key, value: Value) -> Result<MutationEvent, Error> {
        let len = self.slots.len();
        let Layout::List(items) = &mut self.layout else {
            return Err(self.unsupported("insert", self.kind()));
        };
        let position = usize::try_from(index)
            .ok()
            .filter(|&i| i <= len)
            .ok_or_else(|| Error::NotFound(format!("position {} of a list of {}", index, len)))?;

        let slot = self.slots.push_back(value);
        items.insert(position, slot);
        Ok(self.added(index, value, None))
    }

    /// Appends `value` to the end of a list.
    pub fn append(&mut self, value: Value) -> Result<MutationEvent, Error> {
        let Layout::List(items) = &mut self.layout else {
            return Err(self.unsupported("append", self.kind()));
        };
        let slot = self.slots.push_back(value);
        items.push(slot);
        let key = (items.len() - 1) as Key;
        Ok(self.added(key, value, None))
    }

    /// Sets `key` of a map. An existing key is updated in place and keeps its depth.
    pub fn set(&mut self, key: Key, value: Value) -> Result<MutationEvent, Error> {
        let Layout::Map(items) = &mut self.layout else {
            return Err(self.unsupported("set", self.kind()));
        };
        let previous = match items.get(&key) {
            Some(&slot) => {
                let stored = self
                    .slots
                    .get_mut(slot)
                    .ok_or_else(|| Error::NotFound(format!("slot of key {}", key)))?;
                Some(std::mem::replace(stored, value))
            }
            None => {
                let slot = self.slots.push_back(value);
                items.insert(key, slot);
                None
            }
        };
        Ok(self.added(key, value, previous))
    }

    /// Adds `value` to the back of a queue.
    pub fn enqueue(&mut self, value: Value) -> Result<MutationEvent, Error> {
        let Layout::Queue(items) = &mut self.layout else {
            return Err(self.unsupported("enqueue", self.kind()));
        };
        let slot = self.slots.push_back(value);
        items.push_back(slot);
        let key = (items.len() - 1) as Key;
        Ok(self.added(key, value, None))
    }

    /// Removes the front of a queue and returns its value with the produced event.
    pub fn dequeue(&mut self) -> Result<(Value, MutationEvent), Error> {
        if !matches!(self.layout, Layout::Queue(_)) {
            return Err(self.unsupported("dequeue", self.kind()));
        }
        let event = self.remove(0)?;
        match event.change {
            Change::Removed { value, .. } => Ok((value, event)),
            Change::Added { .. } => Err(Error::ProtocolViolation(
                "dequeue produced an addition".to_string(),
            )),
        }
    }

    /// Returns the front of a queue without removing it.
    pub fn peek(&self) -> Result<Value, Error> {
        if !matches!(self.layout, Layout::Queue(_)) {
            return Err(self.unsupported("peek", self.kind()));
        }
        self.get(0)
    }

    /// Removes a list position, a map key or the front (key 0) of a queue.
    ///
    /// The deepest slot of the compaction list takes over the slot of the removed value. The
    /// event carries both values so that backups can heal the stripe the same way.
    pub fn remove(&mut self, key: Key) -> Result<MutationEvent, Error> {
        if matches!(self.layout, Layout::Queue(_)) && key != 0 {
            return Err(Error::ProtocolViolation(format!(
                "queues only remove their front, got position {}",
                key
            )));
        }
        let slot = self.slot(key)?;
        let replacement = self
            .slots
            .last()
            .and_then(|last| self.slots.get(last))
            .copied()
            .ok_or_else(|| Error::NotFound(format!("slot of key {}", key)))?;
        let value = self
            .slots
            .replace_with_tail(slot)
            .ok_or_else(|| Error::NotFound(format!("slot of key {}", key)))?;

        // the slot was resolved from the layout, so the key is present
        match &mut self.layout {
            Layout::List(items) => {
                items.remove(key as usize);
            }
            Layout::Map(items) => {
                items.remove(&key);
            }
            Layout::Queue(items) => {
                items.pop_front();
            }
        }

        Ok(self.event(Change::Removed {
            key,
            value,
            replacement,
        }))
    }

    /// Reads a list or queue position, or a map key.
    pub fn get(&self, key: Key) -> Result<Value, Error> {
        let slot = self.slot(key)?;
        self.slots
            .get(slot)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("slot of key {}", key)))
    }

    fn slot(&self, key: Key) -> Result<SlotId, Error> {
        match &self.layout {
            Layout::List(items) => Ok(items[Self::position(key, items.len())?]),
            Layout::Queue(items) => Ok(items[Self::position(key, items.len())?]),
            Layout::Map(items) => items
                .get(&key)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("key {}", key))),
        }
    }

    /// All values ordered by key. List and queue keys are the positions `0..len`.
    pub fn enumerate(&self) -> BTreeMap<Key, Value> {
        self.keyed_slots()
            .filter_map(|(key, slot)| self.slots.get(slot).map(|v| (key, *v)))
            .collect()
    }

    /// Logical keys in compaction order: entry `k` is the key backed by stripe `k`.
    pub fn keys_by_depth(&self) -> Vec<Key> {
        let keys: HashMap<SlotId, Key> = self.keyed_slots().map(|(k, s)| (s, k)).collect();
        self.slots
            .iter()
            .filter_map(|(slot, _)| keys.get(&slot).copied())
            .collect()
    }

    fn keyed_slots(&self) -> Box<dyn Iterator<Item = (Key, SlotId)> + '_> {
        match &self.layout {
            Layout::List(items) => Box::new(items.iter().enumerate().map(|(i, s)| (i as Key, *s))),
            Layout::Queue(items) => {
                Box::new(items.iter().enumerate().map(|(i, s)| (i as Key, *s)))
            }
            Layout::Map(items) => Box::new(items.iter().map(|(k, s)| (*k, *s))),
        }
    }

    fn position(key: Key, len: usize) -> Result<usize, Error> {
        usize::try_from(key)
            .ok()
            .filter(|&i| i < len)
            .ok_or_else(|| Error::NotFound(format!("position {} of {} elements", key, len)))
    }

    fn added(&self, key: Key, value: Value, previous: Option<Value>) -> MutationEvent {
        self.event(Change::Added {
            key,
            value,
            previous,
        })
    }

    fn event(&self, change: Change) -> MutationEvent {
        MutationEvent {
            cluster_id: self.cluster.cluster_id().to_string(),
            structure_id: self.structure_id.clone(),
            kind: self.kind(),
            change,
        }
    }

    fn unsupported(&self, operation: &str, kind: StructureKind) -> Error {
        Error::ProtocolViolation(format!(
            "{} is not supported by {} {}",
            operation, kind, self.structure_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store(kind: StructureKind) -> PrimaryStore {
        PrimaryStore::new("p0", kind, ClusterInfo::new("cluster", 3, 3).unwrap())
    }

    fn values(store: &PrimaryStore) -> Vec<Value> {
        store.enumerate().into_values().collect()
    }

    #[test]
    fn test_list_insert_and_get() -> Result<(), Error> {
        let mut list = store(StructureKind::List);
        list.insert(0, 123)?;
        list.insert(1, 456)?;
        list.insert(2, 789)?;
        list.insert(1, 5)?;

        assert_eq!(values(&list), vec![123, 5, 456, 789]);
        assert_eq!(list.get(1)?, 5);
        assert_eq!(list.keys_by_depth(), vec![0, 2, 3, 1]);

        assert!(matches!(list.insert(6, 1), Err(Error::NotFound(_))));
        assert!(matches!(list.insert(-1, 1), Err(Error::NotFound(_))));
        assert!(matches!(list.get(4), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_list_remove_compacts_tail() -> Result<(), Error> {
        struct TestCase {
            name: &'static str,
            remove: Key,
            expected_values: Vec<Value>,
            expected_replacement: Value,
            expected_depths: Vec<Key>,
        }

        let test_cases = vec![
            TestCase {
                name: "head",
                remove: 0,
                expected_values: vec![456, 789],
                expected_replacement: 789,
                expected_depths: vec![1, 0],
            },
            TestCase {
                name: "middle",
                remove: 1,
                expected_values: vec![123, 789],
                expected_replacement: 789,
                expected_depths: vec![0, 1],
            },
            TestCase {
                name: "tail",
                remove: 2,
                expected_values: vec![123, 456],
                expected_replacement: 789,
                expected_depths: vec![0, 1],
            },
        ];

        for case in test_cases {
            let mut list = store(StructureKind::List);
            for value in [123, 456, 789] {
                list.append(value)?;
            }
            let removed = [123, 456, 789][case.remove as usize];

            let event = list.remove(case.remove)?;
            assert_eq!(
                event.change,
                Change::Removed {
                    key: case.remove,
                    value: removed,
                    replacement: case.expected_replacement,
                },
                "{}",
                case.name
            );
            assert_eq!(values(&list), case.expected_values, "{}", case.name);
            assert_eq!(list.keys_by_depth(), case.expected_depths, "{}", case.name);
        }
        Ok(())
    }

    #[test]
    fn test_failed_remove_leaves_store_untouched() -> Result<(), Error> {
        let mut list = store(StructureKind::List);
        for value in [1, 2, 3] {
            list.append(value)?;
        }
        assert!(matches!(list.remove(3), Err(Error::NotFound(_))));
        assert_eq!(values(&list), vec![1, 2, 3]);

        // the layout still references a slot the compaction list no longer has
        let slot = list.slot(1)?;
        list.slots.remove(slot);
        assert!(matches!(list.remove(1), Err(Error::NotFound(_))));
        assert!(matches!(&list.layout, Layout::List(items) if items.len() == 3));
        assert_eq!(list.keys_by_depth(), vec![0, 2]);
        Ok(())
    }

    #[test]
    fn test_map_set_updates_in_place() -> Result<(), Error> {
        let mut map = store(StructureKind::Map);
        map.set(10, 1)?;
        map.set(20, 2)?;

        let event = map.set(10, 3)?;
        assert_eq!(
            event.change,
            Change::Added {
                key: 10,
                value: 3,
                previous: Some(1)
            }
        );
        assert_eq!(map.keys_by_depth(), vec![10, 20]);
        assert_eq!(map.get(10)?, 3);

        let event = map.remove(10)?;
        assert_eq!(
            event.change,
            Change::Removed {
                key: 10,
                value: 3,
                replacement: 2
            }
        );
        assert_eq!(map.keys_by_depth(), vec![20]);
        assert!(matches!(map.remove(10), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_queue_operations() -> Result<(), Error> {
        let mut queue = store(StructureKind::Queue);
        assert!(matches!(queue.dequeue(), Err(Error::NotFound(_))));

        queue.enqueue(1)?;
        queue.enqueue(2)?;
        queue.enqueue(3)?;
        assert_eq!(queue.peek()?, 1);

        let (value, event) = queue.dequeue()?;
        assert_eq!(value, 1);
        assert_eq!(
            event.change,
            Change::Removed {
                key: 0,
                value: 1,
                replacement: 3
            }
        );
        assert_eq!(values(&queue), vec![2, 3]);
        assert_eq!(queue.keys_by_depth(), vec![1, 0]);
        assert!(matches!(queue.remove(1), Err(Error::ProtocolViolation(_))));
        Ok(())
    }

    #[test]
    fn test_wrong_kind_is_a_protocol_violation() {
        let mut list = store(StructureKind::List);
        let mut map = store(StructureKind::Map);
        let mut queue = store(StructureKind::Queue);

        assert!(matches!(list.set(0, 1), Err(Error::ProtocolViolation(_))));
        assert!(matches!(list.enqueue(1), Err(Error::ProtocolViolation(_))));
        assert!(matches!(map.append(1), Err(Error::ProtocolViolation(_))));
        assert!(matches!(map.peek(), Err(Error::ProtocolViolation(_))));
        assert!(matches!(
            queue.apply(Mutation::Add { key: 0, value: 1 }),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(queue.insert(0, 1), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_events_carry_structure_identity() -> Result<(), Error> {
        let mut queue = store(StructureKind::Queue);
        let event = queue.apply(Mutation::Append { value: 9 })?;
        assert_eq!(event.cluster_id, "cluster");
        assert_eq!(event.structure_id, "p0");
        assert_eq!(event.kind, StructureKind::Queue);
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize, Value),
        Append(Value),
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<usize>(), any::<Value>()).prop_map(|(i, v)| Op::Insert(i, v)),
            any::<Value>().prop_map(Op::Append),
            any::<usize>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_list_keys_stay_contiguous(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut list = store(StructureKind::List);
            let mut model: Vec<Value> = Vec::new();

            for op in ops {
                match op {
                    Op::Insert(i, v) => {
                        let i = i % (model.len() + 1);
                        list.insert(i as Key, v).unwrap();
                        model.insert(i, v);
                    }
                    Op::Append(v) => {
                        list.append(v).unwrap();
                        model.push(v);
                    }
                    Op::Remove(i) if !model.is_empty() => {
                        let i = i % model.len();
                        list.remove(i as Key).unwrap();
                        model.remove(i);
                    }
                    Op::Remove(_) => {}
                }

                let enumerated = list.enumerate();
                prop_assert!(enumerated.keys().copied().eq(0..model.len() as Key));
                prop_assert_eq!(enumerated.into_values().collect::<Vec<_>>(), model.clone());

                let mut depths = list.keys_by_depth();
                depths.sort();
                prop_assert!(depths.into_iter().eq(0..model.len() as Key));
            }
        }

        #[test]
        fn prop_queue_keys_stay_contiguous(ops in prop::collection::vec(any::<Option<Value>>(), 1..60)) {
            let mut queue = store(StructureKind::Queue);
            let mut model: VecDeque<Value> = VecDeque::new();

            for op in ops {
                match op {
                    Some(v) => {
                        queue.enqueue(v).unwrap();
                        model.push_back(v);
                    }
                    None => {
                        let dequeued = queue.dequeue().ok().map(|(v, _)| v);
                        prop_assert_eq!(dequeued, model.pop_front());
                    }
                }
                prop_assert!(queue.enumerate().keys().copied().eq(0..model.len() as Key));
            }
        }
    }
}
