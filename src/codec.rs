//! Row codec: index/thread rows are a single separator-joined
//! text column — a fixed sequence of stringified metadata fields followed by
//! an opaque, base64-wrapped blob.
//!
//! Field order is part of the on-disk contract and must never change
//! without bumping `FORMAT_VERSION`.

use base64::Engine;
use tracing::warn;

use crate::types::{IndexData, ThreadData};

/// Field separator for the encoded row. Safe here because the blob is
/// base64-encoded before joining, so it can never itself contain `@`.
const SEP: char = '@';

/// The only row format this crate emits. An unknown version on decode is
/// treated as corrupt.
const FORMAT_VERSION: u32 = 1;

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn un_b64(s: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

/// One decoded index row's metadata, minus `expires` (which lives in its
/// own persisted column, not the blob).
pub struct IndexRowFields {
    pub data: IndexData,
    pub sort_field: String,
    pub skip_deleted: bool,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub modseq: Option<u64>,
}

pub fn encode_index_row(fields: &IndexRowFields) -> String {
    let blob = serde_json::to_vec(&fields.data).unwrap_or_default();
    join(&[
        FORMAT_VERSION.to_string(),
        fields.sort_field.clone(),
        bool_token(fields.skip_deleted),
        fields.uidvalidity.to_string(),
        fields.uidnext.to_string(),
        opt_token(fields.modseq),
        b64(&blob),
    ])
}

/// Decodes an index row. A corrupt or undecodable blob yields a fresh empty
/// index while metadata fields that did parse are preserved — this only degrades gracefully when the metadata positions
/// themselves are intact; an unparseable row shape (wrong field count, bad
/// version) falls back to an entirely empty row with the caller's defaults.
pub fn decode_index_row(raw: &str, folder: &str) -> IndexRowFields {
    let parts: Vec<&str> = raw.split(SEP).collect();
    if parts.len() != 7 || parts[0].parse::<u32>() != Ok(FORMAT_VERSION) {
        warn!(folder, "corrupt index row, treating as empty");
        return IndexRowFields {
            data: IndexData::default(),
            sort_field: String::new(),
            skip_deleted: false,
            uidvalidity: 0,
            uidnext: 0,
            modseq: None,
        };
    }

    let data = un_b64(parts[6])
        .and_then(|bytes| serde_json::from_slice::<IndexData>(&bytes).ok())
        .unwrap_or_else(|| {
            warn!(folder, "corrupt index blob, treating as empty");
            IndexData::default()
        });

    IndexRowFields {
        data,
        sort_field: parts[1].to_string(),
        skip_deleted: parts[2] == "1",
        uidvalidity: parts[3].parse().unwrap_or(0),
        uidnext: parts[4].parse().unwrap_or(0),
        modseq: parse_opt(parts[5]),
    }
}

pub struct ThreadRowFields {
    pub data: ThreadData,
    pub skip_deleted: bool,
    pub uidvalidity: u32,
    pub uidnext: u32,
}

pub fn encode_thread_row(fields: &ThreadRowFields) -> String {
    let blob = serde_json::to_vec(&fields.data).unwrap_or_default();
    join(&[
        FORMAT_VERSION.to_string(),
        bool_token(fields.skip_deleted),
        fields.uidvalidity.to_string(),
        fields.uidnext.to_string(),
        b64(&blob),
    ])
}

pub fn decode_thread_row(raw: &str, folder: &str) -> ThreadRowFields {
    let parts: Vec<&str> = raw.split(SEP).collect();
    if parts.len() != 5 || parts[0].parse::<u32>() != Ok(FORMAT_VERSION) {
        warn!(folder, "corrupt thread row, treating as empty");
        return ThreadRowFields {
            data: ThreadData::default(),
            skip_deleted: false,
            uidvalidity: 0,
            uidnext: 0,
        };
    }

    let data = un_b64(parts[4])
        .and_then(|bytes| serde_json::from_slice::<ThreadData>(&bytes).ok())
        .unwrap_or_else(|| {
            warn!(folder, "corrupt thread blob, treating as empty");
            ThreadData::default()
        });

    ThreadRowFields {
        data,
        skip_deleted: parts[1] == "1",
        uidvalidity: parts[2].parse().unwrap_or(0),
        uidnext: parts[3].parse().unwrap_or(0),
    }
}

fn join(parts: &[String]) -> String {
    parts.join(&SEP.to_string())
}

fn bool_token(b: bool) -> String {
    if b { "1".to_string() } else { "0".to_string() }
}

fn opt_token(v: Option<u64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_opt(s: &str) -> Option<u64> {
    if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_row_round_trips() {
        let fields = IndexRowFields {
            data: IndexData::new(vec![9, 7, 3]),
            sort_field: "DATE".to_string(),
            skip_deleted: true,
            uidvalidity: 42,
            uidnext: 10,
            modseq: Some(100),
        };
        let encoded = encode_index_row(&fields);
        let decoded = decode_index_row(&encoded, "INBOX");
        assert_eq!(decoded.data.uids, vec![9, 7, 3]);
        assert_eq!(decoded.sort_field, "DATE");
        assert!(decoded.skip_deleted);
        assert_eq!(decoded.uidvalidity, 42);
        assert_eq!(decoded.uidnext, 10);
        assert_eq!(decoded.modseq, Some(100));
    }

    #[test]
    fn index_row_with_no_modseq_round_trips() {
        let fields = IndexRowFields {
            data: IndexData::new(vec![]),
            sort_field: "ARRIVAL".to_string(),
            skip_deleted: false,
            uidvalidity: 1,
            uidnext: 1,
            modseq: None,
        };
        let decoded = decode_index_row(&encode_index_row(&fields), "INBOX");
        assert_eq!(decoded.modseq, None);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn corrupt_blob_yields_empty_index_but_keeps_metadata() {
        let fields = IndexRowFields {
            data: IndexData::new(vec![1, 2, 3]),
            sort_field: "DATE".to_string(),
            skip_deleted: false,
            uidvalidity: 7,
            uidnext: 8,
            modseq: Some(5),
        };
        let mut encoded = encode_index_row(&fields);
        // Corrupt only the blob segment, keep field count/positions intact.
        let mut parts: Vec<&str> = encoded.split('@').collect();
        parts[6] = "not-valid-base64!!";
        encoded = parts.join("@");

        let decoded = decode_index_row(&encoded, "INBOX");
        assert!(decoded.data.is_empty());
        assert_eq!(decoded.uidvalidity, 7);
        assert_eq!(decoded.uidnext, 8);
        assert_eq!(decoded.modseq, Some(5));
    }

    #[test]
    fn thread_row_round_trips() {
        use crate::types::ThreadNode;
        let data = ThreadData {
            roots: vec![ThreadNode {
                uid: 1,
                children: vec![ThreadNode {
                    uid: 2,
                    children: vec![],
                }],
            }],
        };
        let fields = ThreadRowFields {
            data: data.clone(),
            skip_deleted: true,
            uidvalidity: 9,
            uidnext: 20,
        };
        let decoded = decode_thread_row(&encode_thread_row(&fields), "INBOX");
        assert_eq!(decoded.data, data);
        assert!(decoded.skip_deleted);
        assert_eq!(decoded.uidvalidity, 9);
        assert_eq!(decoded.uidnext, 20);
    }
}
