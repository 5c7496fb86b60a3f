//! Span descriptors, the arena that owns them, and index-linked span lists.
//!
//! A span is a run of whole pages in one of three states. Descriptors live
//! in a [`SpanArena`] and are addressed by [`SpanId`]; lists thread spans
//! through the `prev`/`next` ids stored in the descriptors themselves, so
//! push and unlink stay O(1) and a span can sit in at most one list.

use std::num::NonZeroU32;
use std::ops::{Index, IndexMut};

use super::PAGE_SIZE;
use super::size_class::{NUM_SIZE_CLASSES, class_to_size, objects_in};

/// Handle to a span descriptor in a [`SpanArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(NonZeroU32);

impl SpanId {
    pub(crate) fn from_index(index: usize) -> Self {
        let raw = u32::try_from(index + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .expect("span arena exceeds u32 ids");
        Self(raw)
    }

    /// Slot index in the owning arena.
    pub fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Lifecycle state of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanState {
    /// Owned by the page heap, available for reuse.
    Free,
    /// Carved into objects of one size class and owned by a central list.
    AllocatedSmall,
    /// Handed out whole to a single large request.
    AllocatedLarge,
}

/// Descriptor for a contiguous run of pages.
#[derive(Debug, Clone)]
pub struct Span {
    /// Page-aligned start address.
    pub start: usize,
    /// Number of pages (at least 1).
    pub pages: usize,
    pub state: SpanState,
    /// Size class; meaningful only while `AllocatedSmall`.
    pub class: usize,
    /// Free object addresses; meaningful only while `AllocatedSmall`.
    pub free_objects: Vec<usize>,
    pub(crate) prev: Option<SpanId>,
    pub(crate) next: Option<SpanId>,
    pub(crate) linked: bool,
}

impl Span {
    /// Creates a free span covering `pages` pages from `start`.
    pub fn new(start: usize, pages: usize) -> Self {
        debug_assert_eq!(start % PAGE_SIZE, 0, "span start must be page aligned");
        Self {
            start,
            pages,
            state: SpanState::Free,
            class: 0,
            free_objects: Vec::new(),
            prev: None,
            next: None,
            linked: false,
        }
    }

    pub fn first_page(&self) -> usize {
        self.start / PAGE_SIZE
    }

    pub fn last_page(&self) -> usize {
        self.first_page() + self.pages - 1
    }

    pub fn bytes(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.start + self.bytes()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }

    /// Objects this span holds when carved for its class.
    pub fn capacity(&self) -> usize {
        objects_in(self.class, self.bytes())
    }

    /// Carves the span into objects of `class`.
    ///
    /// Objects that would straddle the end of the span are not created.
    pub fn make_objects(&mut self, class: usize) {
        self.state = SpanState::AllocatedSmall;
        self.class = class;
        let size = class_to_size(class);
        let start = self.start;
        let count = objects_in(class, self.bytes());
        // Reverse so that pops hand out ascending addresses.
        self.free_objects = (0..count).rev().map(|i| start + i * size).collect();
    }

    /// Resets the span to the free state with no objects.
    pub fn reset(&mut self) {
        self.state = SpanState::Free;
        self.class = 0;
        self.free_objects = Vec::new();
    }

    /// True if the page count is sane and a carved span names a real class.
    pub fn is_consistent(&self) -> bool {
        let mut ok = self.pages >= 1 && self.start % PAGE_SIZE == 0;
        if self.state == SpanState::AllocatedSmall {
            ok = ok && self.class < NUM_SIZE_CLASSES && self.free_objects.len() <= self.capacity();
        }
        ok
    }
}

/// Owner of all span descriptors.
///
/// Discarded descriptors (merged into a neighbour) leave their slot empty
/// and the slot is reused by the next allocation.
#[derive(Debug, Default)]
pub struct SpanArena {
    slots: Vec<Option<Span>>,
    vacant: Vec<SpanId>,
}

impl SpanArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a descriptor and returns its id.
    pub fn insert(&mut self, span: Span) -> SpanId {
        if let Some(id) = self.vacant.pop() {
            self.slots[id.index()] = Some(span);
            return id;
        }
        let id = SpanId::from_index(self.slots.len());
        self.slots.push(Some(span));
        id
    }

    /// Discards a descriptor. The span must not be linked into any list.
    pub fn remove(&mut self, id: SpanId) -> Span {
        let span = self.slots[id.index()]
            .take()
            .expect("removing a discarded span");
        debug_assert!(!span.linked, "removing a linked span");
        self.vacant.push(id);
        span
    }

    pub fn get(&self, id: SpanId) -> Option<&Span> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Number of live descriptors.
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpanId, &Span)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|span| (SpanId::from_index(i), span)))
    }
}

impl Index<SpanId> for SpanArena {
    type Output = Span;

    fn index(&self, id: SpanId) -> &Span {
        self.get(id).expect("stale span id")
    }
}

impl IndexMut<SpanId> for SpanArena {
    fn index_mut(&mut self, id: SpanId) -> &mut Span {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("stale span id")
    }
}

/// Doubly linked list of spans threaded through their descriptors.
#[derive(Debug, Clone, Default)]
pub struct SpanList {
    head: Option<SpanId>,
    tail: Option<SpanId>,
    len: usize,
}

impl SpanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<SpanId> {
        self.head
    }

    /// Appends `id` at the tail.
    pub fn push(&mut self, arena: &mut SpanArena, id: SpanId) {
        let tail = self.tail;
        let span = &mut arena[id];
        assert!(!span.linked, "span {id:?} is already in a list");
        span.linked = true;
        span.prev = tail;
        span.next = None;
        match tail {
            Some(tail) => arena[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Unlinks `id`, which must be a member of this list.
    pub fn remove(&mut self, arena: &mut SpanArena, id: SpanId) {
        let span = &mut arena[id];
        debug_assert!(span.linked, "span {id:?} is not in a list");
        let (prev, next) = (span.prev.take(), span.next.take());
        span.linked = false;
        match prev {
            Some(prev) => arena[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena[next].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Unlinks and returns the tail.
    pub fn pop(&mut self, arena: &mut SpanArena) -> Option<SpanId> {
        let tail = self.tail?;
        self.remove(arena, tail);
        Some(tail)
    }

    /// Ids in list order.
    pub fn ids(&self, arena: &SpanArena) -> Vec<SpanId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = arena[id].next;
        }
        ids
    }

    /// First member satisfying `pred`, in list order.
    pub fn find(&self, arena: &SpanArena, pred: impl Fn(&Span) -> bool) -> Option<SpanId> {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let span = &arena[id];
            if pred(span) {
                return Some(id);
            }
            cursor = span.next;
        }
        None
    }
}
