//! Facade: the public contract callers see. Consults the
//! working set first, then the persistence adapter through the row codec,
//! then asks the Validator whether to trust what it found. Invalid
//! entries trigger either a full rebuild via the IMAP client or an
//! incremental repair via the Synchronizer.

use std::collections::BTreeSet;

use tracing::debug;

use crate::codec::{self, IndexRowFields, ThreadRowFields};
use crate::config::CacheConfig;
use crate::errors::{CacheError, CacheResult, StoreError};
use crate::flags::{self, Flag};
use crate::imap::ImapClient;
use crate::storage::Database;
use crate::sync::Synchronizer;
use crate::types::{
    IndexData, IndexRow, MessageObject, SortField, SortOrder, ThreadData, ThreadRow, now_ts,
};
use crate::validator::{self, Outcome};
use crate::working_set::{content_digest, CurrentMessageSlot, IndexSlot, WorkingSet};

/// A stateful, single-session cache bound to one user, one IMAP handle,
/// and one persistent store handle.
pub struct Cache {
    user_id: String,
    db: Database,
    imap: Box<dyn ImapClient>,
    config: CacheConfig,
    working_set: WorkingSet,
}

impl Cache {
    pub fn new(
        user_id: impl Into<String>,
        db: Database,
        imap: Box<dyn ImapClient>,
        config: CacheConfig,
    ) -> Self {
        Cache {
            user_id: user_id.into(),
            db,
            imap,
            config,
            working_set: WorkingSet::new(),
        }
    }

    fn expiry(&self) -> Option<i64> {
        if self.config.ttl_seconds == 0 {
            None
        } else {
            Some(now_ts() + self.config.ttl_seconds)
        }
    }

    fn store_err(err: anyhow::Error) -> CacheError {
        CacheError::Store(StoreError::from(err))
    }

    fn imap_err(err: anyhow::Error) -> CacheError {
        CacheError::imap(err)
    }

    // ---- index ------------------------------------------------------

    pub async fn get_index(
        &mut self,
        folder: &str,
        sort_field: SortField,
        sort_order: SortOrder,
        existing_only: bool,
    ) -> CacheResult<Option<IndexData>> {
        // 1. Working-set fast paths.
        if let Some(slot) = self.working_set.folder(folder).and_then(|f| f.index.clone()) {
            if !slot.validated {
                return Ok(Some(order_as(&IndexData::new(slot.uids), sort_order)));
            }
            if sort_field.matches(&slot.sort_field) {
                return Ok(Some(order_as(&IndexData::new(slot.uids), sort_order)));
            }
        }

        // 2. Load from store unless already consulted this session.
        let already_queried = self
            .working_set
            .folder(folder)
            .map(|f| f.index_queried)
            .unwrap_or(false);
        self.working_set.folder_mut(folder).index_queried = true;

        let stored = if already_queried {
            None
        } else {
            self.db
                .select_index(&self.user_id, folder)
                .await
                .map_err(Self::store_err)?
        };

        let Some(raw) = stored else {
            if existing_only {
                return Ok(None);
            }
            return self.rebuild_index(folder, sort_field, sort_order).await;
        };

        let fields = codec::decode_index_row(&raw.data, folder);

        // 3. Adopt the stored sort field when the caller asked for "ANY".
        let effective_sort_field = if matches!(sort_field, SortField::Any) {
            SortField::Named(fields.sort_field.clone())
        } else {
            sort_field
        };

        if !effective_sort_field.matches(&fields.sort_field) {
            if existing_only {
                return Ok(None);
            }
            return self.rebuild_index(folder, effective_sort_field, sort_order).await;
        }

        // 4. Validate against live folder status.
        let live = self.imap.folder_data(folder).await.map_err(Self::imap_err)?;
        let row = IndexRow {
            data: fields.data.clone(),
            valid: raw.valid,
            sort_field: fields.sort_field.clone(),
            skip_deleted: fields.skip_deleted,
            uidvalidity: fields.uidvalidity,
            uidnext: fields.uidnext,
            modseq: fields.modseq,
            expires: raw.expires,
        };
        let outcome = validator::validate_index(
            Some(&row),
            &live,
            self.config.skip_deleted,
            folder,
            self.imap.as_ref(),
        )
        .await
        .map_err(Self::imap_err)?;

        match outcome {
            Outcome::Valid => {
                self.working_set.folder_mut(folder).index = Some(IndexSlot {
                    uids: fields.data.uids.clone(),
                    validated: true,
                    sort_field: fields.sort_field.clone(),
                    modseq: fields.modseq,
                });
                Ok(Some(order_as(&fields.data, sort_order)))
            }
            Outcome::Invalid { purge_folder, .. } => {
                if purge_folder {
                    self.clear(Some(folder), None).await?;
                } else {
                    self.working_set.drop_index(folder);
                }
                if existing_only {
                    return Ok(None);
                }
                self.rebuild_index(folder, effective_sort_field, sort_order)
                    .await
            }
        }
    }

    async fn rebuild_index(
        &mut self,
        folder: &str,
        sort_field: SortField,
        sort_order: SortOrder,
    ) -> CacheResult<Option<IndexData>> {
        // "ANY" only means something when reading back a stored row; a
        // fresh server-side SORT needs a concrete criterion, so resolve it
        // to the same default the server would apply on its own (arrival
        // order), and persist that resolved name rather than the sentinel.
        let sort_field = match sort_field {
            SortField::Any => SortField::Named("ARRIVAL".to_string()),
            named => named,
        };

        let live = self.imap.folder_data(folder).await.map_err(Self::imap_err)?;
        let uids = self
            .imap
            .index_direct(folder, &sort_field, SortOrder::Asc)
            .await
            .map_err(Self::imap_err)?;
        let data = IndexData::new(uids);

        let fields = IndexRowFields {
            data: data.clone(),
            sort_field: sort_field.as_str().to_string(),
            skip_deleted: self.config.skip_deleted,
            uidvalidity: live.uidvalidity,
            uidnext: live.uidnext,
            modseq: live.highestmodseq,
        };
        self.db
            .upsert_index(
                &self.user_id,
                folder,
                &codec::encode_index_row(&fields),
                true,
                self.expiry(),
            )
            .await
            .map_err(Self::store_err)?;

        self.working_set.folder_mut(folder).index = Some(IndexSlot {
            uids: data.uids.clone(),
            validated: true,
            sort_field: fields.sort_field,
            modseq: live.highestmodseq,
        });

        Ok(Some(order_as(&data, sort_order)))
    }

    // ---- thread -------------------------------------------------------

    pub async fn get_thread(&mut self, folder: &str) -> CacheResult<Option<ThreadData>> {
        if let Some(slot) = self.working_set.folder(folder).and_then(|f| f.thread.clone()) {
            return Ok(Some(slot));
        }

        let already_queried = self
            .working_set
            .folder(folder)
            .map(|f| f.thread_queried)
            .unwrap_or(false);
        self.working_set.folder_mut(folder).thread_queried = true;

        let stored = if already_queried {
            None
        } else {
            self.db
                .select_thread(&self.user_id, folder)
                .await
                .map_err(Self::store_err)?
        };

        let Some(raw) = stored else {
            return self.rebuild_thread(folder).await;
        };

        let fields = codec::decode_thread_row(&raw.data, folder);
        let live = self.imap.folder_data(folder).await.map_err(Self::imap_err)?;
        let row = ThreadRow {
            data: fields.data.clone(),
            skip_deleted: fields.skip_deleted,
            uidvalidity: fields.uidvalidity,
            uidnext: fields.uidnext,
            expires: raw.expires,
        };
        let outcome = validator::validate_thread(Some(&row), &live, self.config.skip_deleted)
            .await
            .map_err(Self::imap_err)?;

        match outcome {
            Outcome::Valid => {
                self.working_set.folder_mut(folder).thread = Some(fields.data.clone());
                Ok(Some(fields.data))
            }
            Outcome::Invalid { purge_folder, .. } => {
                if purge_folder {
                    self.clear(Some(folder), None).await?;
                } else {
                    self.working_set.drop_thread(folder);
                }
                self.rebuild_thread(folder).await
            }
        }
    }

    async fn rebuild_thread(&mut self, folder: &str) -> CacheResult<Option<ThreadData>> {
        let live = self.imap.folder_data(folder).await.map_err(Self::imap_err)?;
        let data = self
            .imap
            .threads_direct(folder)
            .await
            .map_err(Self::imap_err)?;

        let fields = ThreadRowFields {
            data: data.clone(),
            skip_deleted: self.config.skip_deleted,
            uidvalidity: live.uidvalidity,
            uidnext: live.uidnext,
        };
        self.db
            .upsert_thread(
                &self.user_id,
                folder,
                &codec::encode_thread_row(&fields),
                self.expiry(),
            )
            .await
            .map_err(Self::store_err)?;

        self.working_set.folder_mut(folder).thread = Some(data.clone());
        Ok(Some(data))
    }

    // ---- message ------------------------------------------------------

    pub async fn get_message(
        &mut self,
        folder: &str,
        uid: u32,
        update: bool,
        cache: bool,
    ) -> CacheResult<Option<MessageObject>> {
        if let Some(current) = &self.working_set.current {
            if current.matches(folder, uid) {
                return Ok(Some(current.object.clone()));
            }
        }

        let stored = self
            .db
            .select_message(&self.user_id, folder, uid)
            .await
            .map_err(Self::store_err)?;

        let (object, existed_in_store) = if let Some(raw) = stored {
            (
                MessageObject {
                    uid: raw.uid,
                    headers: serde_json::from_str(&raw.data).unwrap_or(serde_json::Value::Null),
                    flags: flags::unpack(raw.flags),
                },
                true,
            )
        } else if update {
            let fetched = self
                .imap
                .fetch_headers(folder, &[uid])
                .await
                .map_err(Self::imap_err)?;
            let Some(object) = fetched.into_iter().next() else {
                return Ok(None);
            };
            (object, false)
        } else {
            return Ok(None);
        };

        if cache {
            let digest = content_digest(&object);
            let new_slot = CurrentMessageSlot {
                folder: folder.to_string(),
                uid,
                object: object.clone(),
                existed_in_store,
                digest_of_last_persisted_form: digest,
            };
            let displaced = self.working_set.replace_current(Some(new_slot));
            self.flush_current_if_dirty(displaced).await?;
        }

        Ok(Some(object))
    }

    pub async fn get_messages(
        &mut self,
        folder: &str,
        uids: &[u32],
    ) -> CacheResult<Vec<MessageObject>> {
        let stored = self
            .db
            .select_messages(&self.user_id, folder, uids)
            .await
            .map_err(Self::store_err)?;

        let present: BTreeSet<u32> = stored.iter().map(|r| r.uid).collect();
        let mut out: Vec<MessageObject> = stored
            .into_iter()
            .map(|raw| MessageObject {
                uid: raw.uid,
                headers: serde_json::from_str(&raw.data).unwrap_or(serde_json::Value::Null),
                flags: flags::unpack(raw.flags),
            })
            .collect();

        let missing: Vec<u32> = uids.iter().copied().filter(|u| !present.contains(u)).collect();
        if !missing.is_empty() {
            let fetched = self
                .imap
                .fetch_headers(folder, &missing)
                .await
                .map_err(Self::imap_err)?;
            for object in fetched {
                self.add_message(folder, object.clone(), false).await?;
                // Bodies are nulled on the returned objects to keep the
                // working set small.
                out.push(MessageObject {
                    uid: object.uid,
                    headers: serde_json::Value::Null,
                    flags: object.flags,
                });
            }
        }

        Ok(out)
    }

    pub async fn add_message(
        &mut self,
        folder: &str,
        message: MessageObject,
        _force: bool,
    ) -> CacheResult<()> {
        let bitmap = flags::pack(&message.flags);
        let headers = serde_json::to_string(&message.headers).unwrap_or_default();
        self.db
            .upsert_message(
                &self.user_id,
                folder,
                message.uid,
                &headers,
                bitmap,
                self.expiry(),
            )
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    pub async fn change_flag(
        &mut self,
        folder: &str,
        uids: &[u32],
        flag_name: &str,
        enabled: bool,
    ) -> CacheResult<()> {
        let Some(flag) = Flag::from_name(flag_name) else {
            debug!(flag_name, "unknown flag, ignoring change_flag");
            return Ok(());
        };

        let slot_matched = if let Some(current) = &mut self.working_set.current {
            if uids.iter().any(|uid| current.matches(folder, *uid)) {
                if enabled {
                    current.object.flags.insert(flag);
                } else {
                    current.object.flags.remove(&flag);
                }
                true
            } else {
                false
            }
        } else {
            false
        };

        if slot_matched && uids.len() == 1 {
            // The close() flush will persist this; no store round trip now.
            return Ok(());
        }

        self.db
            .toggle_message_flag(&self.user_id, folder, uids, flag.bit(), enabled)
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    // ---- removal / clear ------------------------------------------------

    pub async fn remove_message(
        &mut self,
        folder: Option<&str>,
        uids: Option<&[u32]>,
    ) -> CacheResult<()> {
        self.db
            .delete_messages(&self.user_id, folder, uids)
            .await
            .map_err(Self::store_err)?;

        if let (Some(folder), Some(uids)) = (folder, uids) {
            for uid in uids {
                self.working_set.invalidate_current_if_matches(folder, *uid);
            }
        } else if let Some(current) = &self.working_set.current {
            let matches_folder = folder.map(|f| f == current.folder).unwrap_or(true);
            if matches_folder {
                self.working_set.current = None;
            }
        }
        Ok(())
    }

    pub async fn remove_index(&mut self, folder: Option<&str>, remove: bool) -> CacheResult<()> {
        if remove {
            self.db
                .delete_index(&self.user_id, folder)
                .await
                .map_err(Self::store_err)?;
        } else {
            self.db
                .set_index_invalid(&self.user_id, folder)
                .await
                .map_err(Self::store_err)?;
        }

        if let Some(folder) = folder {
            self.working_set.drop_index(folder);
            self.working_set.folder_mut(folder).index_queried = true;
        } else {
            self.working_set.clear();
        }
        Ok(())
    }

    pub async fn remove_thread(&mut self, folder: Option<&str>) -> CacheResult<()> {
        self.db
            .delete_thread(&self.user_id, folder)
            .await
            .map_err(Self::store_err)?;
        if let Some(folder) = folder {
            self.working_set.drop_thread(folder);
        }
        Ok(())
    }

    pub async fn clear(&mut self, folder: Option<&str>, uids: Option<&[u32]>) -> CacheResult<()> {
        self.remove_index(folder, true).await?;
        self.remove_thread(folder).await?;
        self.remove_message(folder, uids).await?;
        Ok(())
    }

    // ---- synchronize / close --------------------------------------------

    pub async fn synchronize(&mut self, folder: &str) -> CacheResult<()> {
        let synchronizer = Synchronizer::new(&self.db, self.imap.as_ref());
        synchronizer
            .synchronize(
                &self.user_id,
                folder,
                self.config.skip_deleted,
                self.config.ttl_seconds,
                &mut self.working_set,
            )
            .await
            .map_err(Self::imap_err)
    }

    pub async fn close(mut self) -> CacheResult<()> {
        let current = self.working_set.current.take();
        self.flush_current_if_dirty(current).await
    }

    async fn flush_current_if_dirty(
        &mut self,
        slot: Option<CurrentMessageSlot>,
    ) -> CacheResult<()> {
        let Some(slot) = slot else {
            return Ok(());
        };
        if !slot.is_dirty() {
            return Ok(());
        }
        let bitmap = flags::pack(&slot.object.flags);
        let headers = serde_json::to_string(&slot.object.headers).unwrap_or_default();
        self.db
            .upsert_message(
                &self.user_id,
                &slot.folder,
                slot.uid,
                &headers,
                bitmap,
                self.expiry(),
            )
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }
}

/// Static garbage-collection sweep: takes an explicit
/// `&Database` rather than a process-wide singleton so it can run
/// concurrently with live `Cache` sessions and be exercised against a
/// throwaway store in tests.
pub async fn gc(db: &Database) -> CacheResult<u64> {
    db.gc_expired(now_ts())
        .await
        .map_err(|e| CacheError::Store(StoreError::from(e)))
}

/// Counts what `gc` would delete, without deleting it.
pub async fn gc_dry_run(db: &Database) -> CacheResult<u64> {
    db.count_expired(now_ts())
        .await
        .map_err(|e| CacheError::Store(StoreError::from(e)))
}

fn order_as(data: &IndexData, order: SortOrder) -> IndexData {
    match order {
        SortOrder::Asc => data.clone(),
        SortOrder::Desc => data.reversed(),
    }
}
