//! Data model shared across the cache: index/thread objects, persisted
//! rows, and the live folder status report the IMAP client collaborator
//! hands back.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::flags::Flag;

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// The "use whatever's already stored" sentinel, as a tagged enum rather
/// than a magic string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    Any,
    Named(String),
}

impl SortField {
    pub fn as_str(&self) -> &str {
        match self {
            SortField::Any => "ANY",
            SortField::Named(s) => s.as_str(),
        }
    }

    pub fn matches(&self, stored: &str) -> bool {
        matches!(self, SortField::Any) || self.as_str() == stored
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// An ordered UID sequence: a folder's "index" object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexData {
    pub uids: Vec<u32>,
}

impl IndexData {
    pub fn new(uids: Vec<u32>) -> Self {
        Self { uids }
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn size(&self) -> usize {
        self.uids.len()
    }

    pub fn max(&self) -> Option<u32> {
        self.uids.iter().copied().max()
    }

    pub fn reversed(&self) -> IndexData {
        let mut uids = self.uids.clone();
        uids.reverse();
        IndexData { uids }
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }

    pub fn remove_all(&mut self, removed: &BTreeSet<u32>) {
        self.uids.retain(|u| !removed.contains(u));
    }
}

/// A thread node: one message plus the messages that reply to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadNode {
    pub uid: u32,
    pub children: Vec<ThreadNode>,
}

impl ThreadNode {
    fn message_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(ThreadNode::message_count)
            .sum::<usize>()
    }
}

/// A thread tree: a folder's "thread" object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadData {
    pub roots: Vec<ThreadNode>,
}

impl ThreadData {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.roots.iter().map(ThreadNode::message_count).sum()
    }
}

/// A persisted per-(user, folder) index row.
#[derive(Clone, Debug)]
pub struct IndexRow {
    pub data: IndexData,
    pub valid: bool,
    pub sort_field: String,
    pub skip_deleted: bool,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub modseq: Option<u64>,
    pub expires: Option<i64>,
}

/// A persisted per-(user, folder) thread row.
#[derive(Clone, Debug)]
pub struct ThreadRow {
    pub data: ThreadData,
    pub skip_deleted: bool,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub expires: Option<i64>,
}

/// The opaque header/structure object for one message, as the Cache sees
/// it: an opaque JSON document plus the flag set the cache understands
/// well enough to pack into a bitmap.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageObject {
    pub uid: u32,
    pub headers: serde_json::Value,
    pub flags: BTreeSet<Flag>,
}

/// A persisted per-(user, folder, uid) message row.
#[derive(Clone, Debug)]
pub struct MessageRow {
    pub uid: u32,
    pub headers: serde_json::Value,
    pub flags_bitmap: u32,
    pub expires: Option<i64>,
}

/// Live folder status, as reported by the IMAP client collaborator.
#[derive(Clone, Debug, Default)]
pub struct FolderStatus {
    pub uidvalidity: u32,
    pub exists: u32,
    pub uidnext: u32,
    pub highestmodseq: Option<u64>,
    pub nomodseq: bool,
    /// `UNDELETED` message count, when the server returns it cheaply.
    pub undeleted_count: Option<u32>,
    /// `UNDELETED` UID set, when the server returns it cheaply.
    pub undeleted_uids: Option<BTreeSet<u32>>,
}

/// Result of a `FETCH ... CHANGEDSINCE` (+ optional `VANISHED`) round trip.
#[derive(Clone, Debug, Default)]
pub struct ChangedSince {
    pub updated: Vec<(u32, BTreeSet<Flag>)>,
    pub vanished: Vec<u32>,
}
