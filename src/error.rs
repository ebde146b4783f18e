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

//! Two-tier error model for the channel engine: [`ProtocolError`] is
//! recoverable into a clean channel teardown (its [`Display`] is the
//! literal text sent to the peer inside an `Error` message); [`Fatal`]
//! indicates an invariant violation and is never constructed from
//! untrusted peer input.

/// Errors arising from validating an inbound message or a local command
/// against the current channel state. Every variant is terminal for the
/// channel: the caller enqueues `Error{problem}` and tears the peer down.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ProtocolError {
    /// delay in blocks not accepted, only seconds-denominated locktimes
    DelayInBlocks,

    /// delay too great
    DelayTooGreat,

    /// min_depth too great
    MinDepthTooGreat,

    /// commitment fee rate too low
    FeeRateTooLow,

    /// only one side can offer anchor
    AnchorOfferMismatch,

    /// bad commit key
    BadCommitKey,

    /// bad final key
    BadFinalKey,

    /// insufficient funds for fee
    InsufficientFundsForFee,

    /// invalid amount_msat
    InvalidAmount,

    /// HTLC expiry in blocks not supported
    ExpiryInBlocks,

    /// too many HTLCs
    TooManyHtlcs,

    /// HTLC id {0} clashes with one already staged
    DuplicateHtlcId(u64),

    /// cannot afford {0} millisatoshis in the commitment transaction
    CannotAffordHtlc(u64),

    /// did not find HTLC {0}
    UnknownHtlcId(u64),

    /// already removed HTLC {0}
    HtlcAlreadyResolved(u64),

    /// invalid r for HTLC {0}
    InvalidPreimage(u64),

    /// empty commit
    EmptyCommit,

    /// commit received while a previous commit is still unrevoked
    DoubleCommit,

    /// malformed signature
    MalformedSignature,

    /// bad signature
    BadSignature,

    /// revocation preimage incorrect
    PreimageIncorrect,

    /// unknown offer anchor value
    UnknownAnchorOffer,

    /// message received before the channel's first commitment was set up
    ChannelNotEstablished,

    /// received a revocation for a commitment that has no predecessor to
    /// revoke
    UnexpectedRevocation,
}

impl ProtocolError {
    /// Renders the text carried in the wire `Error.problem` field.
    pub fn problem(&self) -> String {
        self.to_string()
    }
}

/// A code-level invariant violation: a bug in this engine or in its
/// caller, or evidence of cryptographic compromise. Never triggered by a
/// well-formed-but-adversarial peer; the only correct response is to
/// panic the task, per spec tier-2 error handling.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Fatal {
    /// staging replay disagreement: {0}
    ReplayInconsistency(String),

    /// attempted to sign a CommitInfo which already carries a signature
    AlreadySigned,

    /// shachain insertion failed: new entry is inconsistent with the
    /// previously stored tree
    ShachainInconsistent,
}

/// Top-level result of validating one inbound message: either a clean,
/// recoverable rejection (tier 1) or an invariant violation (tier 2). Most
/// call sites handle `ProtocolError` directly and never construct this; it
/// exists for callers that want a single return type across both tiers.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
pub enum ChannelError {
    #[display(inner)]
    #[from]
    Protocol(ProtocolError),

    #[display(inner)]
    #[from]
    Fatal(Fatal),
}
