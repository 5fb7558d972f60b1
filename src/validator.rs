//! Validator: decides whether a cached index or thread row
//! is still trustworthy against a freshly fetched folder status.
//!
//! Rule order is part of the contract — the first matching rule wins, so
//! these are plain `if`/`return` chains rather than a match, to keep the
//! sequence visible.

use std::collections::BTreeSet;

use crate::imap::ImapClient;
use crate::types::{FolderStatus, IndexRow, ThreadRow};

/// What the Facade does next: an invalid row either gets
/// a full folder purge or just drops the in-memory working-set slot,
/// leaving the persisted row for a cheaper repair path to pick up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Valid,
    Invalid {
        purge_folder: bool,
        exists_in_store: bool,
    },
}

impl Outcome {
    pub fn is_valid(self) -> bool {
        matches!(self, Outcome::Valid)
    }

    fn invalid_drop() -> Outcome {
        Outcome::Invalid {
            purge_folder: false,
            exists_in_store: true,
        }
    }

    fn invalid_purge() -> Outcome {
        Outcome::Invalid {
            purge_folder: true,
            exists_in_store: false,
        }
    }
}

/// Rules 1–2, shared by index and thread validation.
fn uidvalidity_and_exists_gate(
    cached_uidvalidity: Option<u32>,
    cached_is_empty: bool,
    live: &FolderStatus,
) -> Option<Outcome> {
    match cached_uidvalidity {
        None => return Some(Outcome::invalid_purge()),
        Some(v) if v != live.uidvalidity => return Some(Outcome::invalid_purge()),
        _ => {}
    }

    if live.exists == 0 {
        return Some(if cached_is_empty {
            Outcome::Valid
        } else {
            Outcome::invalid_purge()
        });
    }

    if cached_is_empty {
        return Some(Outcome::invalid_drop());
    }

    None
}

pub async fn validate_index(
    cached: Option<&IndexRow>,
    live: &FolderStatus,
    current_skip_deleted: bool,
    folder: &str,
    imap: &dyn ImapClient,
) -> anyhow::Result<Outcome> {
    let Some(row) = cached else {
        // No cached object at all: rule 1/2 still apply via "missing
        // UIDVALIDITY", everything else is moot.
        return Ok(uidvalidity_and_exists_gate(None, true, live).unwrap());
    };

    if let Some(outcome) =
        uidvalidity_and_exists_gate(Some(row.uidvalidity), row.data.is_empty(), live)
    {
        return Ok(outcome);
    }

    // rule 4
    if !row.valid {
        return Ok(Outcome::invalid_drop());
    }

    // rule 5
    if row.skip_deleted != current_skip_deleted {
        return Ok(Outcome::invalid_drop());
    }

    // rule 6
    if let (Some(cached_modseq), Some(live_modseq)) = (row.modseq, live.highestmodseq) {
        if cached_modseq == live_modseq {
            return Ok(Outcome::Valid);
        }
    }

    // rule 7
    if row.uidnext != live.uidnext {
        return Ok(Outcome::invalid_drop());
    }

    // rule 9
    if row.skip_deleted {
        if let Some(count) = live.undeleted_count {
            if count as usize != row.data.size() {
                return Ok(Outcome::invalid_drop());
            }
            return Ok(Outcome::Valid);
        }
        if let Some(live_uids) = &live.undeleted_uids {
            let cached_uids: BTreeSet<u32> = row.data.uids.iter().copied().collect();
            if live_uids != &cached_uids {
                return Ok(Outcome::invalid_drop());
            }
            return Ok(Outcome::Valid);
        }
        let extras = imap
            .search_undeleted_not_uid(folder, &row.data.uids)
            .await?;
        if !extras.is_empty() {
            return Ok(Outcome::invalid_drop());
        }
        return Ok(Outcome::Valid);
    }

    // rule 10
    if live.exists as usize != row.data.size() {
        return Ok(Outcome::invalid_drop());
    }
    let max = row.data.max();
    let server_max = imap.uid_at_sequence(folder, live.exists).await?;
    if max != server_max {
        return Ok(Outcome::invalid_drop());
    }
    Ok(Outcome::Valid)
}

pub async fn validate_thread(
    cached: Option<&ThreadRow>,
    live: &FolderStatus,
    current_skip_deleted: bool,
) -> anyhow::Result<Outcome> {
    let Some(row) = cached else {
        return Ok(uidvalidity_and_exists_gate(None, true, live).unwrap());
    };

    if let Some(outcome) =
        uidvalidity_and_exists_gate(Some(row.uidvalidity), row.data.is_empty(), live)
    {
        return Ok(outcome);
    }

    // rule 5 (threads have no "valid" flag of their own — rule 4 is index-only)
    if row.skip_deleted != current_skip_deleted {
        return Ok(Outcome::invalid_drop());
    }

    // rule 7
    if row.uidnext != live.uidnext {
        return Ok(Outcome::invalid_drop());
    }

    // rule 8
    if !row.skip_deleted && live.exists as usize != row.data.message_count() {
        return Ok(Outcome::invalid_drop());
    }

    Ok(Outcome::Valid)
}
