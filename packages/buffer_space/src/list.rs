use std::iter::FusedIterator;
use std::mem;
use std::sync::Arc;

/// Selects one of the two lists of a memory space.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ListKind {
    /// Buffers available for reuse.
    Free,

    /// Buffers queued for draining by the background consumer.
    Full,
}

/// Direction of a list traversal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum IterDirection {
    /// From the head (most recently inserted) to the tail.
    #[default]
    Forward,

    /// From the tail (least recently inserted) to the head.
    Backward,
}

/// Stable address of a buffer registered in [`BufferLists`].
///
/// The generation distinguishes the current occupant of a slot from earlier ones,
/// so a key kept around after its buffer was unregistered never matches a newer buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct NodeKey {
    index: usize,
    generation: u64,
}

/// The free list and the full list of a memory space, stored in one arena.
///
/// Every buffer the memory space owns occupies one slot for as long as it is registered.
/// The slot records which list the buffer is in, if any, and links it to its neighbors by
/// index. Because membership is a single field, a buffer cannot be in both lists at once.
///
/// Unoccupied slots form their own index-linked chain and are reused before the arena grows.
#[derive(Debug)]
pub(crate) struct BufferLists<T> {
    slots: Vec<Slot<T>>,

    /// Head of the chain of unoccupied slots.
    next_vacant: Option<usize>,

    free: ListEnds,
    full: ListEnds,

    /// Number of occupied slots, whether listed or detached.
    registered: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    entry: Entry<T>,
}

#[derive(Debug)]
enum Entry<T> {
    Occupied(Node<T>),

    Vacant { next_vacant: Option<usize> },
}

#[derive(Debug)]
struct Node<T> {
    buffer: Arc<T>,

    /// `None` means the buffer is detached: held privately by whoever has a handle to it.
    membership: Option<ListKind>,

    /// Neighbor closer to the head.
    prev: Option<usize>,

    /// Neighbor closer to the tail.
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct ListEnds {
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

impl<T> BufferLists<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_vacant: None,
            free: ListEnds::default(),
            full: ListEnds::default(),
            registered: 0,
        }
    }

    /// Number of registered buffers, listed or detached.
    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.registered
    }

    /// Takes ownership of a buffer, returning its key. The buffer starts out detached.
    pub(crate) fn register(&mut self, buffer: Arc<T>) -> NodeKey {
        let node = Node {
            buffer,
            membership: None,
            prev: None,
            next: None,
        };

        // Cannot overflow because that would imply more buffers than virtual memory.
        self.registered = self.registered.wrapping_add(1);

        if let Some(index) = self.next_vacant {
            let slot = self.slot_mut(index);

            let Entry::Vacant { next_vacant } = mem::replace(&mut slot.entry, Entry::Occupied(node))
            else {
                panic!("vacant chain pointed to occupied slot {index}");
            };

            let generation = slot.generation;
            self.next_vacant = next_vacant;

            return NodeKey { index, generation };
        }

        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            entry: Entry::Occupied(node),
        });

        NodeKey {
            index,
            generation: 0,
        }
    }

    /// Releases the slot of a detached buffer, handing the buffer back to the caller.
    ///
    /// # Panics
    ///
    /// Panics if the key is stale or the buffer is still a member of a list.
    pub(crate) fn unregister(&mut self, key: NodeKey) -> Arc<T> {
        let membership = self.node(key).membership;

        assert!(
            membership.is_none(),
            "buffer must be removed from the {membership:?} list before it is deallocated"
        );

        let next_vacant = self.next_vacant;
        let slot = self.slot_mut(key.index);

        // Bumping the generation invalidates every outstanding key to this slot.
        slot.generation = slot.generation.wrapping_add(1);

        let Entry::Occupied(node) = mem::replace(&mut slot.entry, Entry::Vacant { next_vacant })
        else {
            unreachable!("node() verified that the slot is occupied");
        };

        self.next_vacant = Some(key.index);

        // Cannot wrap because we just removed a registered buffer.
        self.registered = self.registered.wrapping_sub(1);

        node.buffer
    }

    /// Whether the key refers to a buffer that is still registered.
    #[must_use]
    pub(crate) fn contains(&self, key: NodeKey) -> bool {
        self.slots.get(key.index).is_some_and(|slot| {
            slot.generation == key.generation && matches!(slot.entry, Entry::Occupied(_))
        })
    }

    /// The list the buffer is in, or `None` if it is detached.
    ///
    /// # Panics
    ///
    /// Panics if the key is stale.
    #[must_use]
    pub(crate) fn membership(&self, key: NodeKey) -> Option<ListKind> {
        self.node(key).membership
    }

    #[must_use]
    pub(crate) fn in_list(&self, kind: ListKind, key: NodeKey) -> bool {
        self.contains(key) && self.membership(key) == Some(kind)
    }

    #[must_use]
    pub(crate) fn count(&self, kind: ListKind) -> usize {
        self.ends(kind).count
    }

    #[must_use]
    pub(crate) fn head(&self, kind: ListKind) -> Option<NodeKey> {
        self.ends(kind).head.map(|index| self.key_at(index))
    }

    /// Inserts a detached buffer at the head of a list.
    ///
    /// # Panics
    ///
    /// Panics if the key is stale or the buffer is already a member of a list.
    pub(crate) fn prepend(&mut self, kind: ListKind, key: NodeKey) {
        let old_head = self.ends(kind).head;

        let node = self.node_mut(key);
        assert!(
            node.membership.is_none(),
            "buffer is already a member of the {:?} list",
            node.membership
        );

        node.membership = Some(kind);
        node.prev = None;
        node.next = old_head;

        match old_head {
            Some(old_head) => self.node_at_mut(old_head).prev = Some(key.index),
            None => self.ends_mut(kind).tail = Some(key.index),
        }

        let ends = self.ends_mut(kind);
        ends.head = Some(key.index);

        // Cannot overflow because that would imply more buffers than virtual memory.
        ends.count = ends.count.wrapping_add(1);
    }

    /// Unlinks a buffer from a list, leaving it detached.
    ///
    /// # Panics
    ///
    /// Panics if the key is stale or the buffer is not a member of the given list.
    pub(crate) fn remove(&mut self, kind: ListKind, key: NodeKey) {
        let node = self.node_mut(key);
        assert!(
            node.membership == Some(kind),
            "buffer is not a member of the {kind:?} list (actual membership: {:?})",
            node.membership
        );

        let prev = node.prev.take();
        let next = node.next.take();
        node.membership = None;

        match prev {
            Some(prev) => self.node_at_mut(prev).next = next,
            None => self.ends_mut(kind).head = next,
        }

        match next {
            Some(next) => self.node_at_mut(next).prev = prev,
            None => self.ends_mut(kind).tail = prev,
        }

        let ends = self.ends_mut(kind);

        // Cannot wrap because the buffer we just unlinked was counted.
        ends.count = ends.count.wrapping_sub(1);
    }

    /// Traverses one list in the given direction.
    pub(crate) fn iter(&self, kind: ListKind, direction: IterDirection) -> ListIter<'_, T> {
        let ends = self.ends(kind);

        let next = match direction {
            IterDirection::Forward => ends.head,
            IterDirection::Backward => ends.tail,
        };

        ListIter {
            lists: self,
            next,
            direction,
        }
    }

    /// Number of registered buffers that are in neither list.
    pub(crate) fn detached(&self) -> usize {
        // Cannot wrap because every listed buffer is also registered.
        self.registered
            .wrapping_sub(self.free.count)
            .wrapping_sub(self.full.count)
    }

    /// Unregisters every detached buffer that no handle refers to any more, returning them.
    ///
    /// New handles are only created under the memory space lock from listed or newly
    /// registered buffers, so once the arena holds the only reference to a detached buffer,
    /// nothing can reach it again.
    pub(crate) fn reclaim_abandoned(&mut self) -> Vec<Arc<T>> {
        if self.detached() == 0 {
            return Vec::new();
        }

        let abandoned: Vec<NodeKey> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.entry {
                Entry::Occupied(node)
                    if node.membership.is_none() && Arc::strong_count(&node.buffer) == 1 =>
                {
                    Some(NodeKey {
                        index,
                        generation: slot.generation,
                    })
                }
                _ => None,
            })
            .collect();

        abandoned
            .into_iter()
            .map(|key| self.unregister(key))
            .collect()
    }

    /// Empties the arena, returning every buffer: first the full list from the head,
    /// then the free list from the head, then any detached buffers.
    pub(crate) fn drain(&mut self) -> Vec<Arc<T>> {
        let mut drained = Vec::with_capacity(self.registered);

        for kind in [ListKind::Full, ListKind::Free] {
            while let Some(key) = self.head(kind) {
                self.remove(kind, key);
                drained.push(self.unregister(key));
            }
        }

        for slot in self.slots.drain(..) {
            if let Entry::Occupied(node) = slot.entry {
                drained.push(node.buffer);
            }
        }

        self.next_vacant = None;
        self.registered = 0;

        drained
    }

    fn ends(&self, kind: ListKind) -> &ListEnds {
        match kind {
            ListKind::Free => &self.free,
            ListKind::Full => &self.full,
        }
    }

    fn ends_mut(&mut self, kind: ListKind) -> &mut ListEnds {
        match kind {
            ListKind::Free => &mut self.free,
            ListKind::Full => &mut self.full,
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot<T> {
        self.slots
            .get_mut(index)
            .expect("list index always refers to an existing slot")
    }

    fn key_at(&self, index: usize) -> NodeKey {
        let generation = self
            .slots
            .get(index)
            .expect("list index always refers to an existing slot")
            .generation;

        NodeKey { index, generation }
    }

    fn node(&self, key: NodeKey) -> &Node<T> {
        match self.slots.get(key.index) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(node),
            }) if *generation == key.generation => node,
            _ => panic!("buffer {key:?} is no longer registered in this memory space"),
        }
    }

    fn node_mut(&mut self, key: NodeKey) -> &mut Node<T> {
        match self.slots.get_mut(key.index) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(node),
            }) if *generation == key.generation => node,
            _ => panic!("buffer {key:?} is no longer registered in this memory space"),
        }
    }

    fn node_at(&self, index: usize) -> &Node<T> {
        match self.slots.get(index).map(|slot| &slot.entry) {
            Some(Entry::Occupied(node)) => node,
            _ => panic!("list link {index} does not refer to an occupied slot"),
        }
    }

    fn node_at_mut(&mut self, index: usize) -> &mut Node<T> {
        match self.slots.get_mut(index).map(|slot| &mut slot.entry) {
            Some(Entry::Occupied(node)) => node,
            _ => panic!("list link {index} does not refer to an occupied slot"),
        }
    }
}

/// Iterator over the buffers of one list, yielding each buffer with its key.
#[derive(Debug)]
pub(crate) struct ListIter<'a, T> {
    lists: &'a BufferLists<T>,
    next: Option<usize>,
    direction: IterDirection,
}

impl<'a, T> Iterator for ListIter<'a, T> {
    type Item = (NodeKey, &'a Arc<T>);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let node = self.lists.node_at(index);

        self.next = match self.direction {
            IterDirection::Forward => node.next,
            IterDirection::Backward => node.prev,
        };

        Some((self.lists.key_at(index), &node.buffer))
    }
}

impl<T> FusedIterator for ListIter<'_, T> {}
