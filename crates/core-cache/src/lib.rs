//! Shared, block-scoped cache of decoded thumbnails.
//!
//! The orchestrator loads one [`BlockSlot`] per comparison block (two key
//! windows, or one shared window on the diagonal) and publishes it under
//! the block's cache index. Workers clone an `Arc` handle per slot: the
//! map itself is only ever written by the orchestrator, and eviction just
//! drops the map's reference, so a worker mid-block keeps its pixels alive
//! until it finishes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A contiguous run of thumbnails, indexed by absolute catalog key.
///
/// Backing storage is one fixed-shape buffer; rows whose thumbnail file is
/// missing or malformed stay unloaded and read back as `None` (the worker
/// then records a per-pair error instead of diffing).
pub struct Window {
    offset: i64,
    count: usize,
    thumb_len: usize,
    data: Vec<u8>,
    loaded: Vec<bool>,
}

impl Window {
    /// Read `count` thumbnails starting at key `offset` from `<dir>/<key>.png`.
    pub fn load(dir: &Path, offset: i64, count: usize, edge: u32) -> Self {
        let thumb_len = (edge as usize) * (edge as usize) * core_imgops::CHANNELS;
        let mut data = vec![0u8; thumb_len * count];
        let mut loaded = vec![false; count];
        for i in 0..count {
            let key = offset + i as i64;
            let path = dir.join(format!("{key}.png"));
            match core_imgops::load_thumbnail(&path, (edge, edge)) {
                Ok(pixels) => {
                    data[i * thumb_len..(i + 1) * thumb_len].copy_from_slice(&pixels);
                    loaded[i] = true;
                }
                Err(err) => {
                    warn!(target: "cache", key, error = %err, "thumbnail_unavailable");
                }
            }
        }
        Self {
            offset,
            count,
            thumb_len,
            data,
            loaded,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Pixels for `key`, or `None` when the key is outside the window or
    /// its thumbnail failed to load.
    pub fn get(&self, key: i64) -> Option<&[u8]> {
        if key < self.offset {
            return None;
        }
        let i = (key - self.offset) as usize;
        if i >= self.count || !self.loaded[i] {
            return None;
        }
        Some(&self.data[i * self.thumb_len..(i + 1) * self.thumb_len])
    }
}

/// The thumbnails one block needs: an x window, plus a y window when the
/// block is off the diagonal.
pub struct BlockSlot {
    x: Window,
    y: Option<Window>,
}

impl BlockSlot {
    pub fn diagonal(x: Window) -> Self {
        Self { x, y: None }
    }

    pub fn rect(x: Window, y: Window) -> Self {
        Self { x, y: Some(y) }
    }

    pub fn x_thumb(&self, key: i64) -> Option<&[u8]> {
        self.x.get(key)
    }

    pub fn y_thumb(&self, key: i64) -> Option<&[u8]> {
        self.y.as_ref().unwrap_or(&self.x).get(key)
    }
}

/// Cache-index-keyed map of resident block slots.
#[derive(Default)]
pub struct ThumbCache {
    slots: RwLock<BTreeMap<usize, Arc<BlockSlot>>>,
}

impl ThumbCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a freshly loaded slot. Orchestrator only.
    pub fn insert(&self, cache_index: usize, slot: BlockSlot) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots.insert(cache_index, Arc::new(slot));
        debug!(target: "cache", cache_index, resident = slots.len(), "slot_inserted");
    }

    /// Read-only handle for workers; `None` once the slot was evicted.
    pub fn slot(&self, cache_index: usize) -> Option<Arc<BlockSlot>> {
        self.slots
            .read()
            .expect("cache lock poisoned")
            .get(&cache_index)
            .cloned()
    }

    /// Drop the map's reference. Worker-held handles stay valid.
    pub fn evict(&self, cache_index: usize) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        if slots.remove(&cache_index).is_some() {
            debug!(target: "cache", cache_index, resident = slots.len(), "slot_evicted");
        }
    }

    pub fn resident(&self) -> usize {
        self.slots.read().expect("cache lock poisoned").len()
    }

    /// Lowest resident cache index; eviction always starts here so the
    /// finished checkpoint stays monotone.
    pub fn lowest_index(&self) -> Option<usize> {
        self.slots
            .read()
            .expect("cache lock poisoned")
            .keys()
            .next()
            .copied()
    }
}
