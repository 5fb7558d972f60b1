//! In-memory working set: per-folder scratch state plus the
//! single current-message slot, all owned exclusively by one `Cache`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::types::{MessageObject, ThreadData};

/// The in-memory index snapshot for one folder.
#[derive(Clone, Debug)]
pub struct IndexSlot {
    pub uids: Vec<u32>,
    pub validated: bool,
    pub sort_field: String,
    pub modseq: Option<u64>,
}

/// Per-folder scratch state. The two "queried" sentinels
/// suppress repeat `SELECT`s against the persistent store within one
/// session.
#[derive(Clone, Debug, Default)]
pub struct FolderSlot {
    pub index: Option<IndexSlot>,
    pub thread: Option<ThreadData>,
    pub index_queried: bool,
    pub thread_queried: bool,
}

/// The exclusively-owned "current message" slot.
#[derive(Clone, Debug)]
pub struct CurrentMessageSlot {
    pub folder: String,
    pub uid: u32,
    pub object: MessageObject,
    pub existed_in_store: bool,
    pub digest_of_last_persisted_form: u64,
}

impl CurrentMessageSlot {
    pub fn matches(&self, folder: &str, uid: u32) -> bool {
        self.folder == folder && self.uid == uid
    }

    /// True when the in-memory object has diverged from what was last
    /// written to the store.
    pub fn is_dirty(&self) -> bool {
        content_digest(&self.object) != self.digest_of_last_persisted_form
    }
}

/// A content-addressed digest: `DefaultHasher` over the object's JSON
/// form. Non-cryptographic by design — this only needs to detect change
/// within one session, not resist a deliberate collision.
pub fn content_digest(object: &MessageObject) -> u64 {
    let mut hasher = DefaultHasher::new();
    match serde_json::to_vec(object) {
        Ok(bytes) => bytes.hash(&mut hasher),
        Err(_) => object.uid.hash(&mut hasher),
    }
    hasher.finish()
}

/// The full in-memory working set owned by one `Cache`.
#[derive(Default)]
pub struct WorkingSet {
    folders: HashMap<String, FolderSlot>,
    pub current: Option<CurrentMessageSlot>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn folder(&self, folder: &str) -> Option<&FolderSlot> {
        self.folders.get(folder)
    }

    pub fn folder_mut(&mut self, folder: &str) -> &mut FolderSlot {
        self.folders.entry(folder.to_string()).or_default()
    }

    pub fn drop_index(&mut self, folder: &str) {
        self.folder_mut(folder).index = None;
    }

    pub fn drop_thread(&mut self, folder: &str) {
        self.folder_mut(folder).thread = None;
    }

    pub fn drop_folder(&mut self, folder: &str) {
        self.folders.remove(folder);
    }

    pub fn clear(&mut self) {
        self.folders.clear();
        self.current = None;
    }

    /// Replaces the current-message slot, returning the previous slot for
    /// the caller to flush if it was dirty.
    pub fn replace_current(
        &mut self,
        slot: Option<CurrentMessageSlot>,
    ) -> Option<CurrentMessageSlot> {
        std::mem::replace(&mut self.current, slot)
    }

    pub fn invalidate_current_if_matches(&mut self, folder: &str, uid: u32) {
        if self
            .current
            .as_ref()
            .is_some_and(|slot| slot.matches(folder, uid))
        {
            self.current = None;
        }
    }
}
