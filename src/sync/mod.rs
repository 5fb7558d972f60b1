//! Synchronizer: incremental repair via `CONDSTORE`/`QRESYNC`.
//! Runs only when the server advertises one of those extensions; brings a
//! folder's cached index and message rows up to date using at most one
//! `ENABLE`, one selective `FETCH … CHANGEDSINCE`, and one rebuild if the
//! index is still invalid afterward.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::codec::{self, IndexRowFields};
use crate::flags::{self, Flag};
use crate::imap::ImapClient;
use crate::storage::Database;
use crate::types::{IndexData, SortField, SortOrder, now_ts};
use crate::validator;
use crate::working_set::WorkingSet;

pub struct Synchronizer<'a> {
    db: &'a Database,
    imap: &'a dyn ImapClient,
}

impl<'a> Synchronizer<'a> {
    pub fn new(db: &'a Database, imap: &'a dyn ImapClient) -> Self {
        Synchronizer { db, imap }
    }

    /// Runs the full repair protocol for one folder. A no-op return (`Ok(())`
    /// with nothing changed) is the common case once `HIGHESTMODSEQ` has
    /// stopped advancing.
    pub async fn synchronize(
        &self,
        user_id: &str,
        folder: &str,
        skip_deleted: bool,
        ttl_seconds: i64,
        ws: &mut WorkingSet,
    ) -> Result<()> {
        // 1. Load the persisted index row; if absent, record the queried
        // sentinel and return.
        let Some(raw) = self.db.select_index(user_id, folder).await? else {
            ws.folder_mut(folder).index_queried = true;
            return Ok(());
        };
        let fields = codec::decode_index_row(&raw.data, folder);

        // 2. If no modseq is stored, incremental sync is impossible.
        let Some(stored_modseq) = fields.modseq else {
            debug!(folder, "no stored modseq, skipping incremental sync");
            return Ok(());
        };

        // 3. Ensure QRESYNC/CONDSTORE is enabled, preferring QRESYNC.
        let qresync = self.imap.capability("QRESYNC").await.unwrap_or(false);
        if qresync {
            self.imap.enable("QRESYNC").await.context("ENABLE QRESYNC")?;
        } else if self.imap.capability("CONDSTORE").await.unwrap_or(false) {
            self.imap
                .enable("CONDSTORE")
                .await
                .context("ENABLE CONDSTORE")?;
        } else {
            debug!(folder, "server advertises neither CONDSTORE nor QRESYNC");
            return Ok(());
        }

        // 4. Force a fresh UIDVALIDITY/HIGHESTMODSEQ on reselect.
        let _ = self.imap.close_folder().await;

        // 5. Fetch current folder status.
        let live = self.imap.folder_data(folder).await?;
        if live.uidvalidity != fields.uidvalidity {
            info!(folder, "uidvalidity changed mid-sync, clearing folder");
            self.clear_folder(user_id, folder).await?;
            ws.drop_folder(folder);
            return Ok(());
        }

        // 6. Nothing to do if modseq hasn't advanced.
        if live.nomodseq || live.highestmodseq == Some(stored_modseq) {
            debug!(folder, "highestmodseq unchanged, nothing to synchronize");
            return Ok(());
        }

        // 7. Load all persisted UIDs and fetch the flag delta.
        let all_uids = self.db.select_all_uids(user_id, folder).await?;
        let changed = self
            .imap
            .fetch_changed_since(folder, &all_uids, stored_modseq, qresync)
            .await?;

        // 8. Apply flag updates, collecting newly-deleted UIDs when
        // skip_deleted is in effect.
        let mut removed: BTreeSet<u32> = BTreeSet::new();
        for (uid, new_flags) in &changed.updated {
            if skip_deleted && new_flags.contains(&Flag::Deleted) {
                removed.insert(*uid);
                continue;
            }
            let bitmap = flags::pack(new_flags);
            self.db
                .update_message_flags_if_changed(user_id, folder, *uid, bitmap)
                .await?;
        }

        // 9. Union VANISHED UIDs into removed.
        removed.extend(changed.vanished.iter().copied());
        let index_invalidated_by_removal = !removed.is_empty();
        let mut index_data = fields.data.clone();
        if index_invalidated_by_removal {
            index_data.remove_all(&removed);
        }

        // 10. Delete removed UIDs from the persistence adapter.
        if !removed.is_empty() {
            let removed_vec: Vec<u32> = removed.iter().copied().collect();
            self.db
                .delete_messages(user_id, Some(folder), Some(&removed_vec))
                .await?;
        }

        // 11. Re-validate; rebuild via fresh SORT if still invalid.
        let new_modseq = live.highestmodseq.unwrap_or(stored_modseq);
        let candidate_row = crate::types::IndexRow {
            data: index_data.clone(),
            valid: !index_invalidated_by_removal,
            sort_field: fields.sort_field.clone(),
            skip_deleted: fields.skip_deleted,
            uidvalidity: fields.uidvalidity,
            uidnext: fields.uidnext,
            modseq: Some(new_modseq),
            expires: raw.expires,
        };

        let outcome = validator::validate_index(
            Some(&candidate_row),
            &live,
            skip_deleted,
            folder,
            self.imap,
        )
        .await?;

        let mut final_data = index_data;
        if !outcome.is_valid() {
            let sort_field = SortField::Named(fields.sort_field.clone());
            final_data = IndexData::new(
                self.imap
                    .index_direct(folder, &sort_field, SortOrder::Asc)
                    .await?,
            );
            if self.db.select_thread(user_id, folder).await?.is_some() {
                self.db.delete_thread(user_id, Some(folder)).await?;
            }
        }

        // 12. Upsert the index row with the (possibly rebuilt) data and
        // the fresh HIGHESTMODSEQ.
        let expires = ttl_to_expiry(ttl_seconds);
        let new_fields = IndexRowFields {
            data: final_data,
            sort_field: fields.sort_field,
            skip_deleted: fields.skip_deleted,
            uidvalidity: live.uidvalidity,
            uidnext: live.uidnext,
            modseq: Some(new_modseq),
        };
        self.db
            .upsert_index(
                user_id,
                folder,
                &codec::encode_index_row(&new_fields),
                true,
                expires,
            )
            .await?;

        ws.drop_index(folder);
        Ok(())
    }

    async fn clear_folder(&self, user_id: &str, folder: &str) -> Result<()> {
        self.db.delete_index(user_id, Some(folder)).await?;
        self.db.delete_thread(user_id, Some(folder)).await?;
        self.db
            .delete_messages(user_id, Some(folder), None)
            .await?;
        warn!(folder, "folder cleared due to uidvalidity mismatch");
        Ok(())
    }
}

fn ttl_to_expiry(ttl_seconds: i64) -> Option<i64> {
    if ttl_seconds == 0 {
        None
    } else {
        Some(now_ts() + ttl_seconds)
    }
}
