//! Three-level radix map from page number to owning span.
//!
//! Each level fans out over 18 bits of the page number, covering a 54-bit
//! page space. Interior and leaf nodes are created on first use and counted
//! against an optional node budget; running out of budget is reported as
//! [`AllocError::PageMapExhausted`] instead of growing without bound.
//!
//! Free and large spans are recorded at their first and last page only.
//! Spans carved into small objects are recorded at every page so that any
//! object address resolves to its span.

use crate::error::AllocError;

use super::span::SpanId;

/// Bits of the page number consumed per level.
pub const LEVEL_BITS: usize = 18;
const FAN_OUT: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: usize = FAN_OUT - 1;

struct Leaf {
    entries: Box<[Option<SpanId>]>,
}

impl Leaf {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: vec![None; FAN_OUT].into_boxed_slice(),
        })
    }
}

struct Interior {
    children: Box<[Option<Box<Leaf>>]>,
}

impl Interior {
    fn new() -> Box<Self> {
        Box::new(Self {
            children: empty_slots(),
        })
    }
}

fn empty_slots<T>() -> Box<[Option<T>]> {
    std::iter::repeat_with(|| None).take(FAN_OUT).collect()
}

/// Index of `page` at `level` (1 = root, 3 = leaf).
pub(crate) fn level_index(page: usize, level: usize) -> usize {
    (page >> (LEVEL_BITS * (3 - level))) & LEVEL_MASK
}

/// Page number to span lookup table.
pub struct PageMap {
    root: Box<[Option<Box<Interior>>]>,
    nodes: usize,
    node_limit: Option<usize>,
}

impl PageMap {
    /// Creates an empty map whose lazily created nodes are capped at `node_limit`.
    pub fn new(node_limit: Option<usize>) -> Self {
        Self {
            root: empty_slots(),
            nodes: 0,
            node_limit,
        }
    }

    /// Number of interior and leaf nodes created so far.
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    /// Returns the span recorded for `page`, if any.
    pub fn get(&self, page: usize) -> Option<SpanId> {
        let interior = self.root[level_index(page, 1)].as_ref()?;
        let leaf = interior.children[level_index(page, 2)].as_ref()?;
        leaf.entries[level_index(page, 3)]
    }

    /// Returns the leaf covering `page`, creating missing nodes.
    ///
    /// Fails without modifying the map if the node budget cannot cover the
    /// nodes this page needs.
    fn leaf_for(&mut self, page: usize) -> Result<&mut Leaf, AllocError> {
        let i1 = level_index(page, 1);
        let i2 = level_index(page, 2);
        let needs_interior = self.root[i1].is_none();
        let needs_leaf = self.root[i1]
            .as_ref()
            .is_none_or(|interior| interior.children[i2].is_none());
        let needed = usize::from(needs_interior) + usize::from(needs_leaf);
        if self
            .node_limit
            .is_some_and(|limit| self.nodes + needed > limit)
        {
            return Err(AllocError::PageMapExhausted { page });
        }
        self.nodes += needed;

        let interior = self.root[i1].get_or_insert_with(Interior::new);
        Ok(interior.children[i2].get_or_insert_with(Leaf::new))
    }

    /// Creates the nodes `page` needs without recording anything, so a
    /// later insert at `page` cannot fail.
    pub fn reserve_page(&mut self, page: usize) -> Result<(), AllocError> {
        self.leaf_for(page).map(|_| ())
    }

    /// Records `id` at `page`, creating intermediate nodes as needed.
    pub fn insert_at(&mut self, page: usize, id: SpanId) -> Result<(), AllocError> {
        let leaf = self.leaf_for(page)?;
        leaf.entries[level_index(page, 3)] = Some(id);
        Ok(())
    }

    /// Clears the entry for `page`. Missing nodes are ignored.
    pub fn remove_at(&mut self, page: usize) {
        let Some(interior) = self.root[level_index(page, 1)].as_mut() else {
            return;
        };
        let Some(leaf) = interior.children[level_index(page, 2)].as_mut() else {
            return;
        };
        leaf.entries[level_index(page, 3)] = None;
    }

    /// Records `id` at the first and last page of a span.
    pub fn insert_span(
        &mut self,
        first_page: usize,
        pages: usize,
        id: SpanId,
    ) -> Result<(), AllocError> {
        let last_page = first_page + pages - 1;
        self.insert_at(first_page, id)?;
        if let Err(err) = self.insert_at(last_page, id) {
            self.remove_at(first_page);
            return Err(err);
        }
        Ok(())
    }

    /// Clears the first and last page entries of a span.
    pub fn remove_span(&mut self, first_page: usize, pages: usize) {
        self.remove_at(first_page);
        self.remove_at(first_page + pages - 1);
    }

    /// Records `id` at every page of a span.
    pub fn insert_range(
        &mut self,
        first_page: usize,
        pages: usize,
        id: SpanId,
    ) -> Result<(), AllocError> {
        for page in first_page..first_page + pages {
            if let Err(err) = self.insert_at(page, id) {
                self.remove_range(first_page, page - first_page);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clears every page entry of a span.
    pub fn remove_range(&mut self, first_page: usize, pages: usize) {
        for page in first_page..first_page + pages {
            self.remove_at(page);
        }
    }
}
