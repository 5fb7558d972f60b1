use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use foldercache::codec::{self, IndexRowFields};
use foldercache::flags::Flag;
use foldercache::imap::ImapClient;
use foldercache::storage::Database;
use foldercache::types::{
    ChangedSince, FolderStatus, IndexData, MessageObject, SortField, SortOrder, ThreadData,
};
use foldercache::{Cache, CacheConfig};

struct FakeImapState {
    folder_status: Mutex<FolderStatus>,
    sorted_uids: Mutex<Vec<u32>>,
    fetch_result: Mutex<Vec<MessageObject>>,
    changed_since: Mutex<ChangedSince>,
    capabilities: Mutex<BTreeSet<String>>,
}

/// A handle to a `FakeImapState` shared with a `Cache` that has already
/// taken ownership of the boxed client — lets a test keep steering server
/// responses after construction (e.g. simulating a `UIDVALIDITY` bump
/// between two calls).
#[derive(Clone)]
struct FakeImapClient(Arc<FakeImapState>);

impl FakeImapClient {
    fn new(status: FolderStatus) -> Self {
        FakeImapClient(Arc::new(FakeImapState {
            folder_status: Mutex::new(status),
            sorted_uids: Mutex::new(vec![]),
            fetch_result: Mutex::new(vec![]),
            changed_since: Mutex::new(ChangedSince::default()),
            capabilities: Mutex::new(BTreeSet::new()),
        }))
    }

    fn set_sorted_uids(&self, uids: Vec<u32>) {
        *self.0.sorted_uids.lock().unwrap() = uids;
    }

    fn set_fetch_result(&self, objects: Vec<MessageObject>) {
        *self.0.fetch_result.lock().unwrap() = objects;
    }

    fn set_status(&self, status: FolderStatus) {
        *self.0.folder_status.lock().unwrap() = status;
    }

    fn set_changed_since(&self, changed: ChangedSince) {
        *self.0.changed_since.lock().unwrap() = changed;
    }

    fn set_capability(&self, name: &str) {
        self.0.capabilities.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl ImapClient for FakeImapClient {
    async fn folder_data(&self, _folder: &str) -> anyhow::Result<FolderStatus> {
        Ok(self.0.folder_status.lock().unwrap().clone())
    }

    async fn fetch_headers(&self, _folder: &str, uids: &[u32]) -> anyhow::Result<Vec<MessageObject>> {
        let all = self.0.fetch_result.lock().unwrap();
        Ok(all
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .cloned()
            .collect())
    }

    async fn index_direct(
        &self,
        _folder: &str,
        _sort_field: &SortField,
        _order: SortOrder,
    ) -> anyhow::Result<Vec<u32>> {
        Ok(self.0.sorted_uids.lock().unwrap().clone())
    }

    async fn threads_direct(&self, _folder: &str) -> anyhow::Result<ThreadData> {
        Ok(ThreadData::default())
    }

    async fn search_undeleted_not_uid(&self, _folder: &str, _uids: &[u32]) -> anyhow::Result<Vec<u32>> {
        Ok(vec![])
    }

    async fn uid_at_sequence(&self, _folder: &str, _seq: u32) -> anyhow::Result<Option<u32>> {
        Ok(None)
    }

    async fn capability(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.0.capabilities.lock().unwrap().contains(name))
    }

    async fn enable(&self, _cap: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_changed_since(
        &self,
        _folder: &str,
        _uids: &[u32],
        _modseq: u64,
        _qresync: bool,
    ) -> anyhow::Result<ChangedSince> {
        Ok(self.0.changed_since.lock().unwrap().clone())
    }

    async fn close_folder(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn status(uidvalidity: u32, exists: u32, uidnext: u32, modseq: Option<u64>) -> FolderStatus {
    FolderStatus {
        uidvalidity,
        exists,
        uidnext,
        highestmodseq: modseq,
        nomodseq: modseq.is_none(),
        undeleted_count: None,
        undeleted_uids: None,
    }
}

#[tokio::test]
async fn cold_read_inserts_a_fresh_index_row() {
    let db = Database::new_in_memory().await.unwrap();
    let imap = FakeImapClient::new(status(42, 3, 10, Some(100)));
    imap.set_sorted_uids(vec![3, 7, 9]);

    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    let index = cache
        .get_index(
            "INBOX",
            SortField::Named("DATE".into()),
            SortOrder::Desc,
            false,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(index.uids, vec![9, 7, 3]);
}

#[tokio::test]
async fn uidvalidity_change_purges_and_rebuilds_empty() {
    // Two independent `Cache` sessions sharing one store, not two calls on
    // the same session: a validated working-set slot is trusted for the
    // rest of its session without re-asking the server, so only a fresh session exercises the revalidate-against-live
    // path this scenario is about.
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool().clone();
    let imap = FakeImapClient::new(status(42, 3, 10, None));
    imap.set_sorted_uids(vec![3, 7, 9]);

    let mut first = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    first
        .get_index("INBOX", SortField::Any, SortOrder::Asc, false)
        .await
        .unwrap();

    let db2 = Database::from_pool(pool).await.unwrap();
    let imap2 = FakeImapClient::new(status(43, 0, 1, None));
    imap2.set_sorted_uids(vec![]);

    let mut second = Cache::new("u1", db2, Box::new(imap2), CacheConfig::default());
    let index = second
        .get_index("INBOX", SortField::Any, SortOrder::Asc, false)
        .await
        .unwrap()
        .unwrap();
    assert!(index.is_empty());
}

#[tokio::test]
async fn unknown_flag_is_ignored_for_current_slot() {
    let db = Database::new_in_memory().await.unwrap();
    let imap = FakeImapClient::new(status(42, 3, 10, Some(100)));
    imap.set_fetch_result(vec![MessageObject {
        uid: 9,
        headers: serde_json::json!({"subject": "hi"}),
        flags: BTreeSet::new(),
    }]);
    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());

    let before = cache
        .get_message("INBOX", 9, true, true)
        .await
        .unwrap()
        .unwrap();
    assert!(before.flags.is_empty());

    cache
        .change_flag("INBOX", &[9], "BOGUS", true)
        .await
        .unwrap();

    let after = cache
        .get_message("INBOX", 9, true, true)
        .await
        .unwrap()
        .unwrap();
    assert!(after.flags.is_empty(), "unknown flag must not be applied");
}

#[tokio::test]
async fn current_message_flag_change_is_flushed_exactly_on_close() {
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool().clone();
    let imap = FakeImapClient::new(status(42, 3, 10, Some(100)));
    imap.set_fetch_result(vec![MessageObject {
        uid: 9,
        headers: serde_json::json!({"subject": "hi"}),
        flags: BTreeSet::new(),
    }]);

    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    cache.get_message("INBOX", 9, true, true).await.unwrap();
    cache
        .change_flag("INBOX", &[9], "SEEN", true)
        .await
        .unwrap();

    let before_close: Option<(i64,)> = sqlx::query_as("SELECT flags FROM cache_messages WHERE uid = 9")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(
        before_close.is_none(),
        "the slot is uncached until close() flushes it"
    );

    cache.close().await.unwrap();

    let (flags,): (i64,) = sqlx::query_as("SELECT flags FROM cache_messages WHERE uid = 9")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(flags, foldercache::flags::Flag::Seen.bit() as i64);
}

#[tokio::test]
async fn change_flag_on_current_slot_is_visible_to_next_read() {
    let db = Database::new_in_memory().await.unwrap();
    let imap = FakeImapClient::new(status(42, 3, 10, Some(100)));
    imap.set_fetch_result(vec![MessageObject {
        uid: 9,
        headers: serde_json::json!({"subject": "hi"}),
        flags: BTreeSet::new(),
    }]);

    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    cache.get_message("INBOX", 9, true, true).await.unwrap();
    cache
        .change_flag("INBOX", &[9], "SEEN", true)
        .await
        .unwrap();

    let after = cache
        .get_message("INBOX", 9, true, true)
        .await
        .unwrap()
        .unwrap();
    assert!(
        after.flags.contains(&foldercache::flags::Flag::Seen),
        "flag change on the current slot must be visible before persistence"
    );
}

#[tokio::test]
async fn multi_uid_flag_change_updates_current_slot_and_store() {
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool().clone();
    db.upsert_message("u1", "INBOX", 7, "{}", 0, None)
        .await
        .unwrap();
    let imap = FakeImapClient::new(status(42, 3, 10, Some(100)));
    imap.set_fetch_result(vec![MessageObject {
        uid: 9,
        headers: serde_json::json!({"subject": "hi"}),
        flags: BTreeSet::new(),
    }]);

    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    cache.get_message("INBOX", 9, true, true).await.unwrap();
    cache
        .change_flag("INBOX", &[7, 9], "SEEN", true)
        .await
        .unwrap();

    let after = cache
        .get_message("INBOX", 9, true, true)
        .await
        .unwrap()
        .unwrap();
    assert!(
        after.flags.contains(&foldercache::flags::Flag::Seen),
        "a multi-uid change touching the current slot must still be visible immediately"
    );

    let (flags,): (i64,) = sqlx::query_as("SELECT flags FROM cache_messages WHERE uid = 7")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(
        flags,
        foldercache::flags::Flag::Seen.bit() as i64,
        "the other targeted uid must still be persisted through to the store"
    );
}

fn seed_index(fields: IndexRowFields) -> String {
    codec::encode_index_row(&fields)
}

#[tokio::test]
async fn incremental_flag_sync_touches_only_the_changed_uid() {
    let db = Database::new_in_memory().await.unwrap();
    db.upsert_index(
        "u1",
        "INBOX",
        &seed_index(IndexRowFields {
            data: IndexData::new(vec![9, 7, 3]),
            sort_field: "ARRIVAL".to_string(),
            skip_deleted: true,
            uidvalidity: 42,
            uidnext: 10,
            modseq: Some(100),
        }),
        true,
        None,
    )
    .await
    .unwrap();
    for uid in [9, 7, 3] {
        db.upsert_message("u1", "INBOX", uid, "{}", 0, None)
            .await
            .unwrap();
    }
    let pool = db.pool().clone();

    let imap = FakeImapClient::new(status(42, 3, 10, Some(105)));
    imap.set_capability("QRESYNC");
    imap.set_changed_since(ChangedSince {
        updated: vec![(7, BTreeSet::from([Flag::Seen]))],
        vanished: vec![],
    });

    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    cache.synchronize("INBOX").await.unwrap();

    let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT uid, flags FROM cache_messages ORDER BY uid")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![(3, 0), (7, Flag::Seen.bit() as i64), (9, 0)],
        "only uid 7 should carry the new flag"
    );
}

#[tokio::test]
async fn qresync_vanished_uid_is_removed_and_index_rebuilt() {
    let db = Database::new_in_memory().await.unwrap();
    db.upsert_index(
        "u1",
        "INBOX",
        &seed_index(IndexRowFields {
            data: IndexData::new(vec![9, 7, 3]),
            sort_field: "ARRIVAL".to_string(),
            skip_deleted: true,
            uidvalidity: 42,
            uidnext: 10,
            modseq: Some(100),
        }),
        true,
        None,
    )
    .await
    .unwrap();
    for uid in [9, 7, 3] {
        db.upsert_message("u1", "INBOX", uid, "{}", 0, None)
            .await
            .unwrap();
    }
    let pool = db.pool().clone();

    let imap = FakeImapClient::new(status(42, 2, 10, Some(105)));
    imap.set_capability("QRESYNC");
    imap.set_changed_since(ChangedSince {
        updated: vec![],
        vanished: vec![7],
    });
    imap.set_sorted_uids(vec![9, 3]);

    let mut cache = Cache::new("u1", db, Box::new(imap), CacheConfig::default());
    cache.synchronize("INBOX").await.unwrap();

    let remaining: Vec<(i64,)> = sqlx::query_as("SELECT uid FROM cache_messages ORDER BY uid")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, vec![(3,), (9,)], "uid 7 must be physically removed");

    let index_db = Database::from_pool(pool).await.unwrap();
    let row = index_db
        .select_index("u1", "INBOX")
        .await
        .unwrap()
        .unwrap();
    assert!(row.valid, "index must be refetched and stored valid again");
    let fields = codec::decode_index_row(&row.data, "INBOX");
    assert_eq!(fields.data.uids, vec![9, 3]);
}
