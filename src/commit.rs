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

//! The commit chain (spec §3 `CommitInfo`): one record per committed
//! state of one side, linked to its predecessor by an owning pointer —
//! the newest entry owns the chain back to genesis, mirroring the
//! `tal`-owned `prev` pointer in the original C implementation this was
//! derived from.

use bitcoin::Transaction;
use secp256k1::ecdsa::Signature;

use crate::htlc::{ChannelState, HtlcStaging};

/// One committed state of one side of the channel.
#[derive(Clone, Debug, StrictEncode, StrictDecode)]
pub struct CommitInfo {
    pub prev: Option<Box<CommitInfo>>,
    /// 0 at channel open, +1 per commit.
    pub commit_num: u64,
    pub revocation_hash: [u8; 32],
    pub tx: Transaction,
    pub cstate: ChannelState,
    /// The peer's signature over `tx`, present once received.
    pub sig: Option<Signature>,
    /// Present once the peer has revoked this level.
    pub revocation_preimage: Option<[u8; 32]>,
    /// Operations staged against the *other* side between this
    /// `CommitInfo` and its predecessor. Consumed exactly once, at
    /// revocation time (spec §3 invariant 3) via [`Self::take_unacked`].
    unacked_changes: Option<Vec<HtlcStaging>>,
}

impl CommitInfo {
    /// Constructs the genesis `CommitInfo` at channel open (`commit_num ==
    /// 0`, no predecessor, no signature yet).
    pub fn genesis(revocation_hash: [u8; 32], tx: Transaction, cstate: ChannelState) -> CommitInfo {
        CommitInfo {
            prev: None,
            commit_num: 0,
            revocation_hash,
            tx,
            cstate,
            sig: None,
            revocation_preimage: None,
            unacked_changes: Some(Vec::new()),
        }
    }

    /// Builds the next `CommitInfo` in the chain, taking ownership of
    /// `prev`.
    pub fn next(
        prev: CommitInfo,
        revocation_hash: [u8; 32],
        tx: Transaction,
        cstate: ChannelState,
    ) -> CommitInfo {
        let commit_num = prev.commit_num + 1;
        CommitInfo {
            prev: Some(Box::new(prev)),
            commit_num,
            revocation_hash,
            tx,
            cstate,
            sig: None,
            revocation_preimage: None,
            unacked_changes: Some(Vec::new()),
        }
    }

    /// Appends an operation to this level's unacked changeset (spec §4.2
    /// `add_unacked`). Panics if called after the changeset has already
    /// been taken — that would mean staging after the level has been
    /// revoked, a code-level bug.
    pub fn add_unacked(&mut self, change: HtlcStaging) {
        self.unacked_changes
            .as_mut()
            .expect("unacked_changes read after being taken")
            .push(change);
    }

    /// Takes the unacked changeset, leaving `None` behind so a second
    /// read panics loudly rather than silently replaying nothing (spec §3
    /// invariant 3, §8 property 10).
    pub fn take_unacked(&mut self) -> Vec<HtlcStaging> {
        self.unacked_changes.take().expect("unacked_changes already consumed")
    }

    /// Immutable predecessor, if any.
    pub fn prev(&self) -> Option<&CommitInfo> {
        self.prev.as_deref()
    }

    pub fn prev_mut(&mut self) -> Option<&mut CommitInfo> {
        self.prev.as_deref_mut()
    }

    /// True if this entry's own predecessor is still awaiting revocation —
    /// i.e. building a commit on top of this one right now would be a
    /// double commit (spec §8 property 3). Genesis (no predecessor) is
    /// never "awaiting" anything, since nothing has been committed on top
    /// of it yet.
    pub fn awaiting_revocation(&self) -> bool {
        self.prev.as_ref().map_or(false, |p| p.revocation_preimage.is_none())
    }
}
