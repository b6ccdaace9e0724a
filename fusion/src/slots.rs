// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

/// Stable handle to a node of a [`SlotList`].
///
/// A handle stays valid while its node is linked, even when the node is moved by
/// [`SlotList::replace_with_tail`]. The generation makes handles of freed nodes stale instead of
/// letting them alias a node that later reuses the same arena cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone)]
struct Node<T> {
    value: T,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

#[derive(Debug, Clone)]
struct Cell<T> {
    generation: u64,
    node: Option<Node<T>>,
}

/// Arena backed doubly linked list.
///
/// Position is defined by traversal order only. All operations are O(1) except iteration.
#[derive(Debug, Clone)]
pub struct SlotList<T> {
    cells: Vec<Cell<T>>,
    free: Vec<usize>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl<T> Default for SlotList<T> {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> SlotList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<SlotId> {
        self.head
    }

    pub fn last(&self) -> Option<SlotId> {
        self.tail
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.node(id).is_some()
    }

    pub fn next(&self, id: SlotId) -> Option<SlotId> {
        self.node(id).and_then(|n| n.next)
    }

    pub fn prev(&self, id: SlotId) -> Option<SlotId> {
        self.node(id).and_then(|n| n.prev)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.node(id).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.node_mut(id).map(|n| &mut n.value)
    }

    /// Links `value` after the current last node.
    pub fn push_back(&mut self, value: T) -> SlotId {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let cell = &mut self.cells[index];
                cell.node = Some(node);
                SlotId {
                    index,
                    generation: cell.generation,
                }
            }
            None => {
                self.cells.push(Cell {
                    generation: 0,
                    node: Some(node),
                });
                SlotId {
                    index: self.cells.len() - 1,
                    generation: 0,
                }
            }
        };

        match self.tail.and_then(|t| self.node_mut(t)) {
            Some(tail) => tail.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        id
    }

    /// Unlinks `id` and returns its value, or `None` if the handle is stale.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let (prev, next) = {
            let node = self.node(id)?;
            (node.prev, node.next)
        };
        self.link(prev, next);
        self.release(id)
    }

    /// Unlinks `id` and moves the last node into its position.
    ///
    /// The moved node keeps its handle. If `id` is the last node this is a plain removal.
    /// Returns the value of the unlinked node, or `None` if the handle is stale.
    pub fn replace_with_tail(&mut self, id: SlotId) -> Option<T> {
        let tail = self.tail?;
        if !self.contains(id) {
            return None;
        }
        if tail == id {
            return self.remove(id);
        }

        // detach the tail first so that a neighbouring `id` sees the shortened list
        let tail_prev = self.node(tail).and_then(|n| n.prev);
        self.link(tail_prev, None);

        let (prev, next) = {
            let node = self.node(id)?;
            (node.prev, node.next)
        };
        if let Some(moved) = self.node_mut(tail) {
            moved.prev = prev;
            moved.next = next;
        }
        self.link(prev, Some(tail));
        self.link(Some(tail), next);
        self.release(id)
    }

    /// Iterates over the linked nodes from first to last.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn node(&self, id: SlotId) -> Option<&Node<T>> {
        self.cells
            .get(id.index)
            .filter(|c| c.generation == id.generation)
            .and_then(|c| c.node.as_ref())
    }

    fn node_mut(&mut self, id: SlotId) -> Option<&mut Node<T>> {
        self.cells
            .get_mut(id.index)
            .filter(|c| c.generation == id.generation)
            .and_then(|c| c.node.as_mut())
    }

    // Makes `prev` and `next` adjacent, updating head and tail when either side is missing.
    fn link(&mut self, prev: Option<SlotId>, next: Option<SlotId>) {
        match prev.and_then(|p| self.node_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    // The caller must have unlinked `id` already.
    fn release(&mut self, id: SlotId) -> Option<T> {
        let cell = self.cells.get_mut(id.index)?;
        let node = cell.node.take()?;
        cell.generation += 1;
        self.free.push(id.index);
        self.len -= 1;
        Some(node.value)
    }
}

pub struct Iter<'a, T> {
    list: &'a SlotList<T>,
    cursor: Option<SlotId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (SlotId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.list.node(id)?;
        self.cursor = node.next;
        Some((id, &node.value))
    }
}
