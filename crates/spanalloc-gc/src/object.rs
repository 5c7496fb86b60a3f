//! Collector objects and the shared sweep.
//!
//! Every object owns one allocation of [`OBJECT_BYTES`] from the allocator
//! and is identified by that address. Objects are threaded onto an
//! intrusive "all objects" list, newest first, which the sweep walks once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use spanalloc_core::{AllocError, Allocator};

/// Bytes allocated per object: type tag, mark bit, list link, and a payload
/// wide enough for two child references.
pub const OBJECT_BYTES: usize = 40;

/// Address of a collector object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(usize);

impl ObjRef {
    pub fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object@{:#x}", self.0)
    }
}

/// Object shape and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Int(i64),
    Pair { head: ObjRef, tail: ObjRef },
}

#[derive(Debug, Clone)]
pub struct GcObject {
    pub kind: ObjectKind,
    pub marked: bool,
    next: Option<ObjRef>,
}

/// All live objects of one VM.
pub struct ObjectHeap {
    objects: HashMap<ObjRef, GcObject>,
    head: Option<ObjRef>,
    allocator: Arc<Allocator>,
}

impl ObjectHeap {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            objects: HashMap::new(),
            head: None,
            allocator,
        }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Allocates an unmarked object and links it at the head of the list.
    pub fn allocate(&mut self, kind: ObjectKind) -> Result<ObjRef, AllocError> {
        let obj = ObjRef(self.allocator.try_malloc(OBJECT_BYTES)?);
        self.objects.insert(
            obj,
            GcObject {
                kind,
                marked: false,
                next: self.head,
            },
        );
        self.head = Some(obj);
        Ok(obj)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, obj: ObjRef) -> bool {
        self.objects.contains_key(&obj)
    }

    pub fn get(&self, obj: ObjRef) -> Option<&GcObject> {
        self.objects.get(&obj)
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut GcObject> {
        self.objects.get_mut(&obj)
    }

    /// Sets the mark bit. Returns `true` only if the object was live and
    /// previously unmarked.
    pub fn mark(&mut self, obj: ObjRef) -> bool {
        match self.objects.get_mut(&obj) {
            Some(object) if !object.marked => {
                object.marked = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_marked(&self, obj: ObjRef) -> bool {
        self.objects.get(&obj).is_some_and(|object| object.marked)
    }

    /// Head and tail of a pair, `None` for scalars and unknown objects.
    pub fn children(&self, obj: ObjRef) -> Option<[ObjRef; 2]> {
        match self.objects.get(&obj)?.kind {
            ObjectKind::Pair { head, tail } => Some([head, tail]),
            ObjectKind::Int(_) => None,
        }
    }

    /// Objects currently marked, in list order.
    pub fn marked(&self) -> Vec<ObjRef> {
        self.iter().filter(|&obj| self.is_marked(obj)).collect()
    }

    /// Walks the object list from the newest object.
    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        std::iter::successors(self.head, |obj| self.objects.get(obj).and_then(|o| o.next))
    }

    fn node_mut(&mut self, obj: ObjRef) -> &mut GcObject {
        self.objects
            .get_mut(&obj)
            .expect("object list links only live objects")
    }

    /// Frees every unmarked object and clears the mark on survivors.
    /// Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.head;
        while let Some(obj) = cursor {
            let node = self.node_mut(obj);
            let next = node.next;
            if node.marked {
                node.marked = false;
                prev = Some(obj);
            } else {
                match prev {
                    Some(p) => self.node_mut(p).next = next,
                    None => self.head = next,
                }
                self.objects.remove(&obj);
                self.allocator.free(obj.addr());
                freed += 1;
            }
            cursor = next;
        }
        freed
    }

    /// Frees every object regardless of reachability.
    pub fn free_all(&mut self) -> usize {
        for obj in self.objects.values_mut() {
            obj.marked = false;
        }
        self.sweep()
    }
}

impl Drop for ObjectHeap {
    fn drop(&mut self) {
        self.free_all();
    }
}
