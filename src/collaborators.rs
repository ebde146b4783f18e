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

//! Interfaces to the external collaborators spec.md §1 and §6 name but
//! deliberately leave outside this crate's scope: Bitcoin transaction and
//! script construction, and the wallet's signing/verification surface.
//! Production wiring against a real wallet/UTXO/script stack happens in
//! the host process; this crate only fixes the shape of the boundary.

use std::time::Duration;

use bitcoin::blockdata::script::Script;
use bitcoin::Transaction;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use crate::htlc::{ChannelState, Side};
use crate::keys::AnchorInfo;

/// Everything needed to build one side's commitment transaction.
pub struct CommitTxContext<'a> {
    pub local_final_key: &'a PublicKey,
    pub remote_final_key: &'a PublicKey,
    pub local_locktime_seconds: u32,
    pub remote_locktime_seconds: u32,
    pub anchor: &'a AnchorInfo,
    pub revocation_hash: [u8; 32],
    pub cstate: &'a ChannelState,
    /// Which side's commitment this is: [`Side::Ours`] when building the
    /// transaction we will sign for the peer to hold, [`Side::Theirs`]
    /// mirrored for our own copy — matching spec §4.3's `side=THEIRS` /
    /// `side=OURS` distinction between outbound and inbound commit
    /// construction.
    pub payer_side: Side,
}

/// Everything needed to build the mutual close transaction.
pub struct CloseTxContext<'a> {
    pub local_script_pubkey: &'a Script,
    pub remote_script_pubkey: &'a Script,
    pub local_amount_sat: u64,
    pub remote_amount_sat: u64,
    pub fee_sat: u64,
}

/// Builds commitment and mutual-close transactions from channel state.
/// Corresponds to `create_commit_tx` in spec.md §6.
pub trait CommitTxFactory {
    /// Returns the built transaction plus the index permutation the
    /// builder applied to outputs (needed because commitment outputs are
    /// ordered by BIP-69-style lexicographic sort, spec §9's "output
    /// permutation map").
    fn build_commit_tx(&self, ctx: &CommitTxContext) -> (Transaction, Vec<usize>);

    fn build_close_tx(&self, ctx: &CloseTxContext) -> Transaction;
}

/// Signing and verification surface backed by the wallet holding this
/// channel's private keys. Corresponds to `sign_theircommit`,
/// `sign_mutual_close` and `verify_tx_sig` in spec.md §6.
pub trait ChainSigner {
    fn sign_theircommit(&self, tx: &Transaction) -> Signature;

    fn sign_mutual_close(&self, tx: &Transaction) -> Signature;

    fn verify_tx_sig(
        &self,
        tx: &Transaction,
        witness_script: &Script,
        pubkey: &PublicKey,
        sig: &Signature,
    ) -> bool;
}

/// A deadline this engine wants to be woken up for. The caller's I/O loop
/// is responsible for actually sleeping and for calling back into `Peer`
/// once a scheduled deadline fires; this crate never blocks or spawns a
/// task itself (spec §5).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimerKind {
    /// Coalesce any HTLCs staged since the last commit into a single
    /// `update_commit`, rather than emitting one per change.
    CommitCoalesce,
    /// An outstanding HTLC's `expiry` has been reached; the caller should
    /// fail it if it has not resolved by the time this fires.
    HtlcExpiry { id: u64 },
}

/// Schedules wakeups without this crate owning a runtime or an executor.
/// Corresponds to the commit-coalescing and HTLC-expiry timers in spec.md
/// §5, kept behind a trait so the engine stays executor-agnostic —
/// consistent with the rest of the workspace never embedding an async
/// runtime inside its protocol-logic crates.
pub trait TimerService {
    fn schedule(&self, after: Duration, what: TimerKind);
}
