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

//! Wire codec for the channel protocol (spec §4.5, §6).

mod messages;

use strict_encoding::{strict_deserialize, strict_serialize};

pub use messages::{
    AnchorOffer, CloseClearing, CloseSignature, Error, Message, Open, OpenAnchor, OpenCommitSig,
    OpenComplete, UpdateAddHtlc, UpdateCommit, UpdateFailHtlc, UpdateFulfillHtlc, UpdateRevocation,
};

/// Encodes a message for the wire. In debug builds this also decodes the
/// result straight back and asserts it is equal to `msg`, catching any
/// asymmetry between a type's `StrictEncode` and `StrictDecode` impls
/// before it ever reaches a peer.
pub fn encode(msg: &Message) -> Vec<u8> {
    let bytes = strict_serialize(msg).expect("message encoding is infallible");
    #[cfg(debug_assertions)]
    {
        let roundtripped: Message =
            strict_deserialize(&bytes).expect("just-encoded message must decode");
        debug_assert!(&roundtripped == msg, "envelope round-trip mismatch for {:?}", msg);
    }
    bytes
}

/// Decodes an inbound envelope into a [`Message`] (spec §4.5 "decode the
/// envelope"). Malformed bytes from the wire are the peer's problem, not
/// ours, so this reports `strict_encoding::Error` rather than panicking.
pub fn decode(bytes: &[u8]) -> Result<Message, strict_encoding::Error> {
    strict_deserialize(bytes)
}
