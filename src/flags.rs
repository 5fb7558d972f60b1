//! The fixed, process-wide flag registry and its bitmap codec.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One entry of the process-wide flag registry. Ordinal order
/// matches the registry table so `pack`/`unpack` stay a straightforward
/// bit-scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Deleted,
    Answered,
    Flagged,
    Draft,
    MdnSent,
    Forwarded,
    SubmitPending,
    Submitted,
    Junk,
    NonJunk,
    Label1,
    Label2,
    Label3,
    Label4,
    Label5,
    HasAttachment,
    HasNoAttachment,
}

impl Flag {
    /// The full registry, in canonical order.
    pub const ALL: [Flag; 18] = [
        Flag::Seen,
        Flag::Deleted,
        Flag::Answered,
        Flag::Flagged,
        Flag::Draft,
        Flag::MdnSent,
        Flag::Forwarded,
        Flag::SubmitPending,
        Flag::Submitted,
        Flag::Junk,
        Flag::NonJunk,
        Flag::Label1,
        Flag::Label2,
        Flag::Label3,
        Flag::Label4,
        Flag::Label5,
        Flag::HasAttachment,
        Flag::HasNoAttachment,
    ];

    /// The registry key: a power-of-two integer.
    pub fn bit(self) -> u32 {
        match self {
            Flag::Seen => 1,
            Flag::Deleted => 2,
            Flag::Answered => 4,
            Flag::Flagged => 8,
            Flag::Draft => 16,
            Flag::MdnSent => 32,
            Flag::Forwarded => 64,
            Flag::SubmitPending => 128,
            Flag::Submitted => 256,
            Flag::Junk => 512,
            Flag::NonJunk => 1024,
            Flag::Label1 => 2048,
            Flag::Label2 => 4096,
            Flag::Label3 => 8192,
            Flag::Label4 => 16384,
            Flag::Label5 => 32768,
            Flag::HasAttachment => 65536,
            Flag::HasNoAttachment => 131072,
        }
    }

    /// The registry name, used at the IMAP-flag-string boundary.
    pub fn name(self) -> &'static str {
        match self {
            Flag::Seen => "SEEN",
            Flag::Deleted => "DELETED",
            Flag::Answered => "ANSWERED",
            Flag::Flagged => "FLAGGED",
            Flag::Draft => "DRAFT",
            Flag::MdnSent => "MDNSENT",
            Flag::Forwarded => "FORWARDED",
            Flag::SubmitPending => "SUBMITPENDING",
            Flag::Submitted => "SUBMITTED",
            Flag::Junk => "JUNK",
            Flag::NonJunk => "NONJUNK",
            Flag::Label1 => "LABEL1",
            Flag::Label2 => "LABEL2",
            Flag::Label3 => "LABEL3",
            Flag::Label4 => "LABEL4",
            Flag::Label5 => "LABEL5",
            Flag::HasAttachment => "HASATTACHMENT",
            Flag::HasNoAttachment => "HASNOATTACHMENT",
        }
    }

    /// Case-sensitive lookup by registry name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Flag> {
        Flag::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Sums the registry keys for the flags present. Strict
/// summation: each flag contributes at most once, which `BTreeSet`
/// guarantees by construction.
pub fn pack(flags: &BTreeSet<Flag>) -> u32 {
    flags.iter().fold(0u32, |acc, f| acc | f.bit())
}

/// Includes `flag` iff `(bits & key) == key`. For these
/// single-bit keys a plain `&` test is equivalent, but the equality form is
/// kept to match the documented contract literally.
pub fn unpack(bits: u32) -> BTreeSet<Flag> {
    Flag::ALL
        .into_iter()
        .filter(|f| (bits & f.bit()) == f.bit())
        .collect()
}
