// Channel packet engine
// Written in 2024 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! The wire message set (spec §6): a single discriminated union,
//! length-prefixed and binary-serialized via `strict_encoding`, the same
//! encoding discipline the rest of this crate's lineage uses for its
//! gossip and channel messages.

use bitcoin::Txid;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

/// Whether a peer is offering to fund the channel's anchor output.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
pub enum AnchorOffer {
    #[display("will-create-anchor")]
    Will,
    #[display("wont-create-anchor")]
    Wont,
}

/// The full protocol message set driving one channel through its
/// lifecycle (spec §4.5, §6).
#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display(inner)]
pub enum Message {
    Open(Open),
    OpenAnchor(OpenAnchor),
    OpenCommitSig(OpenCommitSig),
    OpenComplete(OpenComplete),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    UpdateCommit(UpdateCommit),
    UpdateRevocation(UpdateRevocation),
    CloseClearing(CloseClearing),
    CloseSignature(CloseSignature),
    Error(Error),
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("open_channel({anchor_offer})")]
pub struct Open {
    pub revocation_hash: [u8; 32],
    pub next_revocation_hash: [u8; 32],
    pub commit_key: PublicKey,
    pub final_key: PublicKey,
    pub delay_seconds: u32,
    pub min_depth: u32,
    pub initial_fee_rate: u32,
    pub anchor_offer: AnchorOffer,
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("open_anchor({txid})")]
pub struct OpenAnchor {
    pub txid: Txid,
    pub output_index: u32,
    pub amount: u64,
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("open_commit_sig")]
pub struct OpenCommitSig {
    pub sig: Signature,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("open_complete")]
pub struct OpenComplete;

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("update_add_htlc({id})")]
pub struct UpdateAddHtlc {
    pub id: u64,
    pub amount_msat: u64,
    pub r_hash: [u8; 32],
    /// Absolute expiry in seconds; spec.md §4.5 rejects block-based
    /// expiries before a value ever reaches this type.
    pub expiry: u32,
    /// Opaque onion routing payload (spec.md §9: routing semantics are
    /// out of scope here).
    pub route: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("update_fulfill_htlc({id})")]
pub struct UpdateFulfillHtlc {
    pub id: u64,
    pub r: [u8; 32],
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("update_fail_htlc({id})")]
pub struct UpdateFailHtlc {
    pub id: u64,
    /// Opaque failure payload (spec.md §9).
    pub reason: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("update_commit")]
pub struct UpdateCommit {
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("update_revocation")]
pub struct UpdateRevocation {
    pub revocation_preimage: [u8; 32],
    pub next_revocation_hash: [u8; 32],
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("close_clearing")]
pub struct CloseClearing {
    pub scriptpubkey: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug, Display, StrictEncode, StrictDecode)]
#[display("close_signature({close_fee})")]
pub struct CloseSignature {
    pub close_fee: u64,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Debug, Display, StrictEncode, StrictDecode)]
#[display("error({problem})")]
pub struct Error {
    pub problem: String,
}

impl Error {
    pub fn new(problem: impl Into<String>) -> Error {
        Error { problem: problem.into() }
    }
}

impl From<crate::error::ProtocolError> for Error {
    fn from(e: crate::error::ProtocolError) -> Self {
        Error::new(e.problem())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strict_encoding::{strict_deserialize, strict_serialize};

    fn roundtrip(msg: &Message) {
        let encoded = strict_serialize(msg).expect("encode");
        let decoded: Message = strict_deserialize(&encoded).expect("decode");
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn error_message_roundtrips() {
        roundtrip(&Message::Error(Error::new("bad signature")));
    }

    #[test]
    fn open_complete_roundtrips() {
        roundtrip(&Message::OpenComplete(OpenComplete));
    }

    #[test]
    fn update_add_htlc_roundtrips() {
        roundtrip(&Message::UpdateAddHtlc(UpdateAddHtlc {
            id: 7,
            amount_msat: 250_000,
            r_hash: [9u8; 32],
            expiry: 1_700_000_000,
            route: vec![1, 2, 3],
        }));
    }

    #[test]
    fn update_revocation_roundtrips() {
        roundtrip(&Message::UpdateRevocation(UpdateRevocation {
            revocation_preimage: [1u8; 32],
            next_revocation_hash: [2u8; 32],
        }));
    }

    #[test]
    fn close_clearing_roundtrips() {
        roundtrip(&Message::CloseClearing(CloseClearing { scriptpubkey: vec![0, 1, 2, 3] }));
    }
}
