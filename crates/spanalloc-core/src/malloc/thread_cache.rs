//! Front-end magazine cache.
//!
//! One magazine of free objects per size class, refilled from the central
//! lists in batches. When the cached bytes exceed the cache budget, every
//! magazine gives back half of its low-water mark: the objects that sat
//! unused since the previous shrink.

use std::sync::Arc;

use crate::error::AllocError;
use crate::log::{AllocatorLogLevel, LogEvent, Telemetry};

use super::central::CentralFreeList;
use super::size_class::{NUM_SIZE_CLASSES, class_to_size};

/// Per-size-class stack of free object addresses.
#[derive(Debug, Clone, Default)]
pub struct Magazine {
    objects: Vec<usize>,
    /// Smallest length observed since the last shrink.
    low_mark: usize,
}

impl Magazine {
    fn pop(&mut self) -> Option<usize> {
        let obj = self.objects.pop()?;
        self.low_mark = self.low_mark.min(self.objects.len());
        Some(obj)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn low_mark(&self) -> usize {
        self.low_mark
    }
}

/// The allocator's single cache instance.
pub struct ThreadCache {
    magazines: Vec<Magazine>,
    /// Bytes held across all magazines.
    total_size: usize,
    cache_limit: usize,
    batch_size: usize,
    hits: u64,
    misses: u64,
    central: Arc<CentralFreeList>,
    telemetry: Arc<Telemetry>,
}

impl ThreadCache {
    pub(crate) fn new(
        central: Arc<CentralFreeList>,
        batch_size: usize,
        cache_limit: usize,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            magazines: vec![Magazine::default(); NUM_SIZE_CLASSES],
            total_size: 0,
            cache_limit,
            batch_size: batch_size.max(1),
            hits: 0,
            misses: 0,
            central,
            telemetry,
        }
    }

    /// Pops a free object of `class`, refilling from the central list when
    /// the magazine is empty.
    pub fn get_object(&mut self, class: usize) -> Result<usize, AllocError> {
        if let Some(obj) = self.magazines[class].pop() {
            self.hits += 1;
            self.take_bytes(class_to_size(class));
            return Ok(obj);
        }
        self.misses += 1;
        loop {
            self.fill(class)?;
            if let Some(obj) = self.magazines[class].pop() {
                self.take_bytes(class_to_size(class));
                return Ok(obj);
            }
        }
    }

    fn fill(&mut self, class: usize) -> Result<(), AllocError> {
        let magazine = &mut self.magazines[class];
        let n = self
            .central
            .get_objects(class, self.batch_size, &mut magazine.objects)?;
        // Objects come back in allocation order; hand out the lowest first.
        let len = magazine.objects.len();
        magazine.objects[len - n..].reverse();
        self.total_size += n * class_to_size(class);
        self.telemetry.set_cache_bytes(self.total_size);
        Ok(())
    }

    /// Caches a freed object, shrinking the cache if it is over budget.
    pub fn insert(&mut self, class: usize, addr: usize) {
        self.magazines[class].objects.push(addr);
        self.total_size += class_to_size(class);
        if self.total_size > self.cache_limit {
            self.gc();
        }
        self.telemetry.set_cache_bytes(self.total_size);
    }

    /// Returns half of each magazine's low-water mark to the central lists
    /// and resets the marks to the current lengths.
    pub fn gc(&mut self) {
        let before = self.total_size;
        for class in 0..NUM_SIZE_CLASSES {
            let magazine = &mut self.magazines[class];
            let drain = magazine.low_mark / 2;
            if drain > 0 {
                let keep = magazine.objects.len() - drain;
                let returned = magazine.objects.split_off(keep);
                self.central.insert_objects(class, &returned);
                self.total_size -= drain * class_to_size(class);
            }
            let magazine = &mut self.magazines[class];
            magazine.low_mark = magazine.objects.len();
        }
        self.telemetry.set_cache_bytes(self.total_size);
        self.telemetry.record(
            AllocatorLogLevel::Debug,
            "cache",
            "cache_gc",
            "success",
            LogEvent {
                size: Some(before - self.total_size),
                details: format!("before={before} after={}", self.total_size),
                ..LogEvent::default()
            },
        );
    }

    /// Returns every cached object to the central lists.
    pub fn flush(&mut self) {
        let before = self.total_size;
        for class in 0..NUM_SIZE_CLASSES {
            let magazine = &mut self.magazines[class];
            let returned = std::mem::take(&mut magazine.objects);
            magazine.low_mark = 0;
            self.central.insert_objects(class, &returned);
        }
        self.total_size = 0;
        self.telemetry.set_cache_bytes(0);
        self.telemetry.record(
            AllocatorLogLevel::Debug,
            "cache",
            "cache_flush",
            "success",
            LogEvent {
                size: Some(before),
                ..LogEvent::default()
            },
        );
    }

    fn take_bytes(&mut self, bytes: usize) {
        self.total_size -= bytes;
        self.telemetry.set_cache_bytes(self.total_size);
    }

    /// Bytes currently cached.
    pub fn size(&self) -> usize {
        self.total_size
    }

    pub fn magazine(&self, class: usize) -> &Magazine {
        &self.magazines[class]
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Every cached object as `(class, addr)`.
    pub fn objects(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.magazines
            .iter()
            .enumerate()
            .flat_map(|(class, magazine)| magazine.objects.iter().map(move |&addr| (class, addr)))
    }
}
