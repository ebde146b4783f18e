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

//! The per-peer state machine (spec §4.5, §4.6): the single entry point
//! that turns inbound [`Message`]s and local commands into channel state
//! transitions, queued outbound messages, and (on violation) a
//! [`ProtocolError`] or a [`Fatal`] panic.
//!
//! Grounded directly on `accept_pkt_*`/`queue_pkt_*` in the legacy
//! c-lightning daemon this crate's message set is drawn from: every
//! `queue_*` method here mirrors a `queue_pkt_*` function (build a message,
//! mutate state immediately), every `receive_*` method mirrors an
//! `accept_pkt_*` function (validate an inbound message, mutate state, or
//! reject with a [`ProtocolError`]).

use std::time::Duration;

use bitcoin_hashes::{sha256, Hash};
use log::{debug, info, warn};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use crate::collaborators::{
    ChainSigner, CloseTxContext, CommitTxContext, CommitTxFactory, TimerKind, TimerService,
};
use crate::commit::CommitInfo;
use crate::error::ProtocolError;
use crate::htlc::{ChannelState, HtlcStaging, Htlc, Side, MAX_HTLCS_PER_SIDE};
use crate::keys::{AnchorInfo, PeerSecrets};
use crate::shachain::ShachainStore;
use crate::wire::{
    AnchorOffer, CloseClearing, CloseSignature, Message, Open, OpenAnchor, OpenCommitSig,
    OpenComplete, UpdateAddHtlc, UpdateCommit, UpdateFailHtlc, UpdateFulfillHtlc, UpdateRevocation,
};

/// Bounds a peer's `Open` offer must fall within before we'll accept it
/// (spec §4.5 `accept_pkt_open`), set by the host process.
#[derive(Clone, Copy, Debug)]
pub struct ChannelLimits {
    pub rel_locktime_max: u32,
    pub anchor_confirms_max: u32,
    pub commitment_fee_rate_min: u32,
}

/// Negotiated parameters and commit chain belonging to one side of the
/// channel (spec §3 `PeerVisibleState`).
#[derive(Clone, Debug)]
pub struct PeerVisibleState {
    pub offer_anchor: AnchorOffer,
    pub commitkey: PublicKey,
    pub finalkey: PublicKey,
    pub locktime_seconds: u32,
    pub mindepth: u32,
    pub commit_fee_rate: u32,
    pub next_revocation_hash: [u8; 32],
    /// `None` until the anchor is established and [`Peer::setup_first_commit`]
    /// runs; `Some` for the remainder of the channel's life.
    pub commit: Option<CommitInfo>,
    pub staging_cstate: Option<ChannelState>,
}

impl PeerVisibleState {
    fn new(
        offer_anchor: AnchorOffer,
        commitkey: PublicKey,
        finalkey: PublicKey,
        locktime_seconds: u32,
        mindepth: u32,
        commit_fee_rate: u32,
    ) -> PeerVisibleState {
        PeerVisibleState {
            offer_anchor,
            commitkey,
            finalkey,
            locktime_seconds,
            mindepth,
            commit_fee_rate,
            next_revocation_hash: [0u8; 32],
            commit: None,
            staging_cstate: None,
        }
    }

    fn commit(&self) -> &CommitInfo {
        self.commit.as_ref().expect("commit accessed before setup_first_commit")
    }

    fn commit_mut(&mut self) -> &mut CommitInfo {
        self.commit.as_mut().expect("commit accessed before setup_first_commit")
    }

    fn staging(&self) -> &ChannelState {
        self.staging_cstate.as_ref().expect("staging accessed before setup_first_commit")
    }

    fn staging_mut(&mut self) -> &mut ChannelState {
        self.staging_cstate.as_mut().expect("staging accessed before setup_first_commit")
    }
}

/// Mutual close negotiation state (spec §4.6).
#[derive(Clone, Debug, Default)]
pub struct ClosingInfo {
    pub our_fee: u64,
    pub our_script: Vec<u8>,
    pub their_script: Option<Vec<u8>>,
    pub their_fee: Option<u64>,
    pub their_sig: Option<Signature>,
}

fn check_preimage(preimage: &[u8; 32], hash: &[u8; 32]) -> bool {
    sha256::Hash::hash(preimage).into_inner() == *hash
}

/// How long to wait for more changes to stage before emitting a commit,
/// once the first change lands on an otherwise-clean staging snapshot
/// (spec §5 commit-coalescing timer).
const COMMIT_COALESCE_DELAY: Duration = Duration::from_millis(50);

/// The live state machine for one channel with one peer.
///
/// `F` builds the Bitcoin transactions this engine signs over; `S` performs
/// the actual signing/verification; `T` schedules the commit-coalescing and
/// HTLC-expiry wakeups (spec §5). All three are injected because
/// transaction/script construction, signing and timer ownership are out of
/// this crate's scope (spec §1).
pub struct Peer<F: CommitTxFactory, S: ChainSigner, T: TimerService> {
    limits: ChannelLimits,
    secrets: PeerSecrets,
    pub local: PeerVisibleState,
    pub remote: PeerVisibleState,
    anchor: Option<AnchorInfo>,
    local_pending_revocation_hash: Option<[u8; 32]>,
    remote_pending_revocation_hash: Option<[u8; 32]>,
    their_preimages: ShachainStore,
    htlc_id_counter: u64,
    pub closing: Option<ClosingInfo>,
    commit_factory: F,
    signer: S,
    timers: T,
}

impl<F: CommitTxFactory, S: ChainSigner, T: TimerService> Peer<F, S, T> {
    pub fn new(
        limits: ChannelLimits,
        secrets: PeerSecrets,
        commitkey: PublicKey,
        finalkey: PublicKey,
        locktime_seconds: u32,
        mindepth: u32,
        commit_fee_rate: u32,
        offer_anchor: AnchorOffer,
        commit_factory: F,
        signer: S,
        timers: T,
    ) -> Peer<F, S, T> {
        Peer {
            limits,
            secrets,
            local: PeerVisibleState::new(
                offer_anchor,
                commitkey,
                finalkey,
                locktime_seconds,
                mindepth,
                commit_fee_rate,
            ),
            // Filled in once the peer's `Open` arrives.
            remote: PeerVisibleState::new(
                AnchorOffer::Wont,
                commitkey,
                finalkey,
                0,
                0,
                0,
            ),
            anchor: None,
            local_pending_revocation_hash: None,
            remote_pending_revocation_hash: None,
            their_preimages: ShachainStore::new(),
            htlc_id_counter: 0,
            closing: None,
            commit_factory,
            signer,
            timers,
        }
    }

    fn next_htlc_id(&mut self) -> u64 {
        let id = self.htlc_id_counter;
        self.htlc_id_counter += 1;
        id
    }

    /// Guards every inbound handler that touches `commit`/`staging_cstate`
    /// against a peer sending a post-handshake message (`UpdateAddHtlc`,
    /// `UpdateCommit`, `UpdateRevocation`, ...) before
    /// [`Self::setup_first_commit`] has run. Recoverable (spec §7 tier 1):
    /// malformed/out-of-sequence input from an untrusted peer, not a bug in
    /// this engine.
    fn require_established(&self) -> Result<(), ProtocolError> {
        if self.local.commit.is_none() || self.remote.commit.is_none() {
            return Err(ProtocolError::ChannelNotEstablished);
        }
        Ok(())
    }

    // ---- open handshake -------------------------------------------------

    /// spec §4.5 `queue_pkt_open`: offers our opening parameters.
    pub fn queue_open(&mut self) -> Message {
        let revocation_hash = self.secrets.revocation_hash(0);
        self.local.next_revocation_hash = self.secrets.revocation_hash(1);
        self.local_pending_revocation_hash = Some(revocation_hash);

        Message::Open(Open {
            revocation_hash,
            next_revocation_hash: self.local.next_revocation_hash,
            commit_key: self.local.commitkey,
            final_key: self.local.finalkey,
            delay_seconds: self.local.locktime_seconds,
            min_depth: self.local.mindepth,
            initial_fee_rate: self.local.commit_fee_rate,
            anchor_offer: self.local.offer_anchor,
        })
    }

    /// spec §4.5 `accept_pkt_open`.
    pub fn receive_open(&mut self, o: Open) -> Result<(), ProtocolError> {
        if o.delay_seconds > self.limits.rel_locktime_max {
            return Err(ProtocolError::DelayTooGreat);
        }
        if o.min_depth > self.limits.anchor_confirms_max {
            return Err(ProtocolError::MinDepthTooGreat);
        }
        if o.initial_fee_rate < self.limits.commitment_fee_rate_min {
            return Err(ProtocolError::FeeRateTooLow);
        }
        if o.anchor_offer == self.local.offer_anchor {
            return Err(ProtocolError::AnchorOfferMismatch);
        }

        self.remote.offer_anchor = o.anchor_offer;
        self.remote.locktime_seconds = o.delay_seconds;
        self.remote.mindepth = o.min_depth;
        self.remote.commit_fee_rate = o.initial_fee_rate;
        self.remote.commitkey = o.commit_key;
        self.remote.finalkey = o.final_key;
        self.remote.next_revocation_hash = o.next_revocation_hash;
        self.remote_pending_revocation_hash = Some(o.revocation_hash);
        Ok(())
    }

    /// spec §4.5 `queue_pkt_anchor`: only the offering side calls this,
    /// after it has located a funding UTXO. Runs [`Self::setup_first_commit`]
    /// itself, matching the original's inline call.
    pub fn queue_anchor(
        &mut self,
        anchor: AnchorInfo,
        funder_balance_msat: u64,
    ) -> Result<Message, ProtocolError> {
        debug_assert_eq!(self.local.offer_anchor, AnchorOffer::Will);
        let msg = OpenAnchor {
            txid: anchor.txid,
            output_index: anchor.output_index,
            amount: anchor.satoshis,
        };
        self.anchor = Some(anchor);
        self.setup_first_commit(Side::Ours, funder_balance_msat)?;
        Ok(Message::OpenAnchor(msg))
    }

    /// spec §4.5 `accept_pkt_anchor`. `witnessscript` is the 2-of-2 redeem
    /// script for the anchor output, built by the host from both commit
    /// keys — script construction is out of this crate's scope (spec §1).
    pub fn receive_anchor(
        &mut self,
        a: OpenAnchor,
        witnessscript: bitcoin::blockdata::script::Script,
        funder_balance_msat: u64,
    ) -> Result<(), ProtocolError> {
        debug_assert_eq!(self.remote.offer_anchor, AnchorOffer::Will);
        self.anchor = Some(AnchorInfo {
            txid: a.txid,
            output_index: a.output_index,
            satoshis: a.amount,
            witnessscript,
        });
        self.setup_first_commit(Side::Theirs, funder_balance_msat)
    }

    /// Populates `local.commit` and `remote.commit` once the anchor is
    /// known (spec §4.3 `setup_first_commit`): the funding side pays the
    /// base commitment fee out of its own balance.
    fn setup_first_commit(
        &mut self,
        funder: Side,
        funder_balance_msat: u64,
    ) -> Result<(), ProtocolError> {
        let anchor = self.anchor.as_ref().expect("anchor set before setup_first_commit");
        let other = funder.opposite();
        let mut cstate = match funder {
            Side::Ours => ChannelState::new(funder_balance_msat, 0, self.local.commit_fee_rate),
            Side::Theirs => ChannelState::new(0, funder_balance_msat, self.local.commit_fee_rate),
        };
        let _ = other;
        let fee_msat = cstate.commitment_fee_msat(0);
        if !cstate.debit(funder, fee_msat) {
            return Err(ProtocolError::InsufficientFundsForFee);
        }

        let local_revocation_hash =
            self.local_pending_revocation_hash.take().expect("local open already queued");
        let remote_revocation_hash =
            self.remote_pending_revocation_hash.take().expect("remote open already accepted");

        let local_ctx = CommitTxContext {
            local_final_key: &self.local.finalkey,
            remote_final_key: &self.remote.finalkey,
            local_locktime_seconds: self.local.locktime_seconds,
            remote_locktime_seconds: self.remote.locktime_seconds,
            anchor,
            revocation_hash: local_revocation_hash,
            cstate: &cstate,
            payer_side: Side::Theirs,
        };
        let (local_tx, _) = self.commit_factory.build_commit_tx(&local_ctx);
        self.local.commit = Some(CommitInfo::genesis(local_revocation_hash, local_tx, cstate.copy()));

        let remote_ctx = CommitTxContext {
            local_final_key: &self.local.finalkey,
            remote_final_key: &self.remote.finalkey,
            local_locktime_seconds: self.local.locktime_seconds,
            remote_locktime_seconds: self.remote.locktime_seconds,
            anchor,
            revocation_hash: remote_revocation_hash,
            cstate: &cstate,
            payer_side: Side::Ours,
        };
        let (remote_tx, _) = self.commit_factory.build_commit_tx(&remote_ctx);
        self.remote.commit =
            Some(CommitInfo::genesis(remote_revocation_hash, remote_tx, cstate.copy()));

        self.local.staging_cstate = Some(cstate.copy());
        self.remote.staging_cstate = Some(cstate);
        Ok(())
    }

    /// spec §4.5 `queue_pkt_open_commit_sig`: signs the peer's first
    /// commitment transaction.
    pub fn queue_open_commit_sig(&mut self) -> Message {
        let sig = self.signer.sign_theircommit(&self.remote.commit().tx);
        self.remote.commit_mut().sig = Some(sig.clone());
        Message::OpenCommitSig(OpenCommitSig { sig })
    }

    /// spec §4.5 `accept_pkt_open_commit_sig`.
    pub fn receive_open_commit_sig(&mut self, s: OpenCommitSig) -> Result<(), ProtocolError> {
        self.check_and_save_commit_sig(Side::Ours, s.sig)
    }

    fn check_and_save_commit_sig(&mut self, which: Side, sig: Signature) -> Result<(), ProtocolError> {
        self.require_established()?;
        let anchor = self.anchor.as_ref().expect("anchor known once commit sigs are exchanged");
        let (tx, remote_commitkey) = {
            let ci = match which {
                Side::Ours => self.local.commit(),
                Side::Theirs => self.remote.commit(),
            };
            (ci.tx.clone(), self.remote.commitkey)
        };
        if !self.signer.verify_tx_sig(&tx, &anchor.witnessscript, &remote_commitkey, &sig) {
            return Err(ProtocolError::BadSignature);
        }
        let ci = match which {
            Side::Ours => self.local.commit_mut(),
            Side::Theirs => self.remote.commit_mut(),
        };
        ci.sig = Some(sig);
        Ok(())
    }

    /// spec §4.5 `queue_pkt_open_complete` / `accept_pkt_open_complete`.
    pub fn queue_open_complete(&mut self) -> Message {
        Message::OpenComplete(OpenComplete)
    }

    pub fn receive_open_complete(&mut self, _: OpenComplete) -> Result<(), ProtocolError> {
        Ok(())
    }

    // ---- HTLCs ------------------------------------------------------------

    /// spec §4.5 `queue_pkt_htlc_add`: we originate an HTLC. Staged
    /// immediately into `remote.staging_cstate` (the commitment we will next
    /// sign for the peer), queued unacked there for mirroring once the peer
    /// revokes in response.
    pub fn queue_htlc_add(
        &mut self,
        amount_msat: u64,
        expiry: u32,
        rhash: sha256::Hash,
    ) -> Result<Message, ProtocolError> {
        if amount_msat == 0 {
            return Err(ProtocolError::InvalidAmount);
        }
        let id = self.next_htlc_id();
        let was_clean = self.remote.staging().changes == self.remote.commit().cstate.changes;
        let htlc = self
            .remote
            .staging_mut()
            .add_htlc(Side::Ours, amount_msat, expiry, rhash, id)
            .ok_or(ProtocolError::CannotAffordHtlc(id))?;
        self.remote.commit_mut().add_unacked(HtlcStaging::Add { htlc });
        if was_clean {
            self.timers.schedule(COMMIT_COALESCE_DELAY, TimerKind::CommitCoalesce);
        }
        self.timers.schedule(Duration::from_secs(expiry as u64), TimerKind::HtlcExpiry { id });
        debug!("queued htlc {} for {} msat", id, amount_msat);
        Ok(Message::UpdateAddHtlc(UpdateAddHtlc {
            id,
            amount_msat,
            r_hash: rhash.into_inner(),
            expiry,
            route: Vec::new(),
        }))
    }

    /// spec §4.5 `accept_pkt_htlc_add`: the peer originates an HTLC against
    /// us. Staged immediately into `local.staging_cstate`.
    pub fn receive_htlc_add(&mut self, u: UpdateAddHtlc) -> Result<(), ProtocolError> {
        self.require_established()?;
        if u.amount_msat == 0 {
            return Err(ProtocolError::InvalidAmount);
        }
        if self.remote.staging().side(Side::Theirs).htlcs.len() == MAX_HTLCS_PER_SIDE
            || self.local.staging().side(Side::Theirs).htlcs.len() == MAX_HTLCS_PER_SIDE
        {
            return Err(ProtocolError::TooManyHtlcs);
        }
        if self.remote.staging().htlc_by_id(u.id, Side::Theirs).is_some()
            || self.local.staging().htlc_by_id(u.id, Side::Theirs).is_some()
        {
            return Err(ProtocolError::DuplicateHtlcId(u.id));
        }
        let rhash = sha256::Hash::from_inner(u.r_hash);
        let was_clean = self.local.staging().changes == self.local.commit().cstate.changes;
        let htlc = self
            .local
            .staging_mut()
            .add_htlc(Side::Theirs, u.amount_msat, u.expiry, rhash, u.id)
            .ok_or(ProtocolError::CannotAffordHtlc(u.id))?;
        self.local.commit_mut().add_unacked(HtlcStaging::Add { htlc });
        if was_clean {
            self.timers.schedule(COMMIT_COALESCE_DELAY, TimerKind::CommitCoalesce);
        }
        self.timers.schedule(Duration::from_secs(u.expiry as u64), TimerKind::HtlcExpiry { id: u.id });
        Ok(())
    }

    /// spec §4.5 `queue_pkt_htlc_fulfill`: we fulfill an HTLC the peer
    /// originated, now mirrored into `remote.staging_cstate` with
    /// `Side::Theirs`.
    pub fn queue_htlc_fulfill(&mut self, id: u64, r: sha256::Hash) -> Result<Message, ProtocolError> {
        let index = self
            .remote
            .staging()
            .htlc_by_id(id, Side::Theirs)
            .ok_or(ProtocolError::UnknownHtlcId(id))?;
        self.remote.staging_mut().fulfill_htlc(index, Side::Theirs);
        self.remote.commit_mut().add_unacked(HtlcStaging::Fulfill { id, r });
        Ok(Message::UpdateFulfillHtlc(UpdateFulfillHtlc { id, r: r.into_inner() }))
    }

    fn find_committed_htlc(&self, id: u64) -> Result<usize, ProtocolError> {
        self.require_established()?;
        if self.local.commit().cstate.htlc_by_id(id, Side::Ours).is_none() {
            return Err(ProtocolError::UnknownHtlcId(id));
        }
        self.local.staging().htlc_by_id(id, Side::Ours).ok_or(ProtocolError::HtlcAlreadyResolved(id))
    }

    /// spec §4.5 `accept_pkt_htlc_fulfill`.
    pub fn receive_htlc_fulfill(&mut self, f: UpdateFulfillHtlc) -> Result<(), ProtocolError> {
        let index = self.find_committed_htlc(f.id)?;
        let r = sha256::Hash::from_inner(f.r);
        let rhash = sha256::Hash::hash(&f.r);
        if rhash != self.local.staging().side(Side::Ours).htlcs[index].rhash {
            return Err(ProtocolError::InvalidPreimage(f.id));
        }
        self.local.staging_mut().fulfill_htlc(index, Side::Ours);
        self.local.commit_mut().add_unacked(HtlcStaging::Fulfill { id: f.id, r });
        Ok(())
    }

    /// spec §4.5 `queue_pkt_htlc_fail`.
    pub fn queue_htlc_fail(&mut self, id: u64, reason: Vec<u8>) -> Result<Message, ProtocolError> {
        let index = self
            .remote
            .staging()
            .htlc_by_id(id, Side::Theirs)
            .ok_or(ProtocolError::UnknownHtlcId(id))?;
        self.remote.staging_mut().fail_htlc(index, Side::Theirs);
        self.remote.commit_mut().add_unacked(HtlcStaging::Fail { id, reason: reason.clone() });
        Ok(Message::UpdateFailHtlc(UpdateFailHtlc { id, reason }))
    }

    /// spec §4.5 `accept_pkt_htlc_fail`.
    pub fn receive_htlc_fail(&mut self, f: UpdateFailHtlc) -> Result<(), ProtocolError> {
        let index = self.find_committed_htlc(f.id)?;
        self.local.staging_mut().fail_htlc(index, Side::Ours);
        self.local.commit_mut().add_unacked(HtlcStaging::Fail { id: f.id, reason: f.reason });
        Ok(())
    }

    // ---- commit / revocation -----------------------------------------------

    /// spec §4.3/§4.5 `queue_pkt_commit`: signs the peer's next commitment,
    /// capturing every change staged into `remote.staging_cstate` so far.
    pub fn queue_commit(&mut self) -> Result<Message, ProtocolError> {
        self.require_established()?;
        let prev = self.remote.commit.take().expect("remote commit established");
        if prev.cstate.changes == self.remote.staging().changes {
            self.remote.commit = Some(prev);
            return Err(ProtocolError::EmptyCommit);
        }
        if prev.awaiting_revocation() {
            self.remote.commit = Some(prev);
            return Err(ProtocolError::DoubleCommit);
        }
        let revocation_hash = self.remote.next_revocation_hash;
        let cstate = self.remote.staging().copy();
        let anchor = self.anchor.as_ref().expect("anchor established");
        let ctx = CommitTxContext {
            local_final_key: &self.local.finalkey,
            remote_final_key: &self.remote.finalkey,
            local_locktime_seconds: self.local.locktime_seconds,
            remote_locktime_seconds: self.remote.locktime_seconds,
            anchor,
            revocation_hash,
            cstate: &cstate,
            payer_side: Side::Ours,
        };
        let (tx, _) = self.commit_factory.build_commit_tx(&ctx);
        let sig = self.signer.sign_theircommit(&tx);
        let mut ci = CommitInfo::next(prev, revocation_hash, tx, cstate);
        ci.sig = Some(sig.clone());
        info!("signing commit #{} for peer", ci.commit_num);
        self.remote.commit = Some(ci);
        Ok(Message::UpdateCommit(UpdateCommit { sig }))
    }

    /// spec §4.3/§4.5 `accept_pkt_commit`.
    pub fn receive_commit(&mut self, c: UpdateCommit) -> Result<(), ProtocolError> {
        self.require_established()?;
        let prev = self.local.commit.take().expect("local commit established");
        if prev.cstate.changes == self.local.staging().changes {
            self.local.commit = Some(prev);
            return Err(ProtocolError::EmptyCommit);
        }
        if prev.awaiting_revocation() {
            self.local.commit = Some(prev);
            return Err(ProtocolError::DoubleCommit);
        }
        let revocation_hash = self.local.next_revocation_hash;
        let cstate = self.local.staging().copy();
        let anchor = self.anchor.as_ref().expect("anchor established");
        let ctx = CommitTxContext {
            local_final_key: &self.local.finalkey,
            remote_final_key: &self.remote.finalkey,
            local_locktime_seconds: self.local.locktime_seconds,
            remote_locktime_seconds: self.remote.locktime_seconds,
            anchor,
            revocation_hash,
            cstate: &cstate,
            payer_side: Side::Theirs,
        };
        let (tx, _) = self.commit_factory.build_commit_tx(&ctx);
        let mut ci = CommitInfo::next(prev, revocation_hash, tx, cstate);
        let next_commit_num = ci.commit_num;

        if !self.signer.verify_tx_sig(&ci.tx, &anchor.witnessscript, &self.remote.commitkey, &c.sig) {
            self.local.commit = Some(ci);
            return Err(ProtocolError::BadSignature);
        }
        ci.sig = Some(c.sig);
        self.local.commit = Some(ci);
        self.local.next_revocation_hash = self.secrets.revocation_hash(next_commit_num + 1);
        Ok(())
    }

    /// spec §4.4/§4.5 `queue_pkt_revocation`: reveals the preimage for our
    /// now-superseded local commitment, then mirrors that commitment's
    /// unacked (peer-originated) changes into `remote.staging_cstate`.
    pub fn queue_revocation(&mut self) -> Message {
        let next_revocation_hash = self.local.next_revocation_hash;
        let prev = self.local.commit_mut().prev_mut().expect("a commit update just landed");
        assert!(prev.revocation_preimage.is_none(), "already revoked this level");

        let preimage = self.secrets.revocation_preimage(prev.commit_num);
        prev.revocation_preimage = Some(preimage);
        let changes = prev.take_unacked();

        if !changes.is_empty() {
            crate::staging::apply_changeset(self.remote.staging_mut(), Side::Theirs, &changes)
                .expect("local commit chain and remote staging diverged");
            debug!("mirrored {} change(s) into remote staging after our revocation", changes.len());
        }
        Message::UpdateRevocation(UpdateRevocation { revocation_preimage: preimage, next_revocation_hash })
    }

    /// spec §4.4/§4.5 `accept_pkt_revocation`.
    pub fn receive_revocation(&mut self, r: UpdateRevocation) -> Result<(), ProtocolError> {
        self.require_established()?;
        let ci = self.remote.commit_mut().prev_mut().ok_or(ProtocolError::UnexpectedRevocation)?;
        if !check_preimage(&r.revocation_preimage, &ci.revocation_hash) {
            return Err(ProtocolError::PreimageIncorrect);
        }
        assert!(ci.revocation_preimage.is_none(), "already revoked this level");
        ci.revocation_preimage = Some(r.revocation_preimage);
        let commit_num = ci.commit_num;
        let changes = ci.take_unacked();

        // A shachain insertion failure here means our own previously stored
        // preimages are inconsistent with this one — an invariant violation,
        // never a consequence of what the peer sent (spec §7 tier 2).
        self.their_preimages
            .add_hash(u64::MAX - commit_num, r.revocation_preimage)
            .expect("shachain insertion invariant violated");

        self.remote.next_revocation_hash = r.next_revocation_hash;

        if !changes.is_empty() {
            crate::staging::apply_changeset(self.local.staging_mut(), Side::Ours, &changes)
                .expect("remote commit chain and local staging diverged");
        }
        Ok(())
    }

    // ---- mutual close -------------------------------------------------------

    /// spec §4.6 `queue_pkt_close_clearing`.
    pub fn queue_close_clearing(&mut self, our_script: Vec<u8>) -> Message {
        self.closing = Some(ClosingInfo { our_script: our_script.clone(), ..Default::default() });
        Message::CloseClearing(CloseClearing { scriptpubkey: our_script })
    }

    /// spec §4.6 `accept_pkt_close_clearing`.
    pub fn receive_close_clearing(&mut self, c: CloseClearing) -> Result<(), ProtocolError> {
        self.closing.get_or_insert_with(Default::default).their_script = Some(c.scriptpubkey);
        Ok(())
    }

    /// spec §4.6 `queue_pkt_close_signature`.
    pub fn queue_close_signature(
        &mut self,
        fee_sat: u64,
        local_amount_sat: u64,
        remote_amount_sat: u64,
    ) -> Message {
        let closing = self.closing.as_mut().expect("close_clearing exchanged first");
        closing.our_fee = fee_sat;
        let local_script = bitcoin::blockdata::script::Script::from(closing.our_script.clone());
        let remote_script =
            bitcoin::blockdata::script::Script::from(closing.their_script.clone().unwrap_or_default());
        let ctx = CloseTxContext {
            local_script_pubkey: &local_script,
            remote_script_pubkey: &remote_script,
            local_amount_sat,
            remote_amount_sat,
            fee_sat,
        };
        let close_tx = self.commit_factory.build_close_tx(&ctx);
        let sig = self.signer.sign_mutual_close(&close_tx);
        info!("offered mutual close fee {} sat", fee_sat);
        Message::CloseSignature(CloseSignature { close_fee: fee_sat, sig })
    }

    /// spec §4.6 `accept_pkt_close_signature`: records the peer's
    /// counter-offer. Deciding whether it converges (equal fee, both sigs
    /// valid) is left to the host loop, which can re-call
    /// [`Self::queue_close_signature`] with a new fee if it does not.
    pub fn receive_close_signature(&mut self, c: CloseSignature) -> Result<(), ProtocolError> {
        let closing = self.closing.as_mut().ok_or(ProtocolError::UnknownAnchorOffer)?;
        closing.their_fee = Some(c.close_fee);
        closing.their_sig = Some(c.sig);
        Ok(())
    }

    /// Converts a validation failure into the wire message to send before
    /// tearing the channel down (spec §7 tier 1).
    pub fn error_message(err: &ProtocolError) -> Message {
        warn!("tearing down channel: {}", err);
        Message::Error(crate::wire::Error::new(err.problem()))
    }

    pub fn htlc_by_id(&self, id: u64, side: Side) -> Option<&Htlc> {
        self.local.staging().side(side).htlcs.iter().find(|h| h.id == id)
    }

    /// spec §4.5 inbound dispatch: decode happens in the caller (via
    /// [`crate::wire::decode`]); this matches the already-decoded envelope
    /// to the handler for its tag and returns either `None` (accepted) or
    /// the `Error` payload to send before tearing the channel down.
    ///
    /// `anchor_ctx` carries the `witnessscript`/`funder_balance_msat` pair a
    /// host must supply alongside an `OpenAnchor` message (script
    /// construction is out of this crate's scope, spec §1); dispatching
    /// that variant without it is a host usage error, not a peer one.
    pub fn dispatch(
        &mut self,
        msg: Message,
        anchor_ctx: Option<(bitcoin::blockdata::script::Script, u64)>,
    ) -> Option<Message> {
        let result = match msg {
            Message::Open(o) => self.receive_open(o),
            Message::OpenAnchor(a) => {
                let (witnessscript, funder_balance_msat) = anchor_ctx
                    .expect("dispatching OpenAnchor requires witnessscript/funder_balance_msat");
                self.receive_anchor(a, witnessscript, funder_balance_msat)
            }
            Message::OpenCommitSig(s) => self.receive_open_commit_sig(s),
            Message::OpenComplete(c) => self.receive_open_complete(c),
            Message::UpdateAddHtlc(u) => self.receive_htlc_add(u),
            Message::UpdateFulfillHtlc(f) => self.receive_htlc_fulfill(f),
            Message::UpdateFailHtlc(f) => self.receive_htlc_fail(f),
            Message::UpdateCommit(c) => self.receive_commit(c),
            Message::UpdateRevocation(r) => self.receive_revocation(r),
            Message::CloseClearing(c) => self.receive_close_clearing(c),
            Message::CloseSignature(c) => self.receive_close_signature(c),
            Message::Error(e) => {
                warn!("peer reported error: {}", e.problem);
                Ok(())
            }
        };
        result.err().as_ref().map(Self::error_message)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::blockdata::script::Script;
    use bitcoin::{Transaction, TxOut};
    use secp256k1::{Secp256k1, SecretKey};

    struct StubFactory;

    impl CommitTxFactory for StubFactory {
        fn build_commit_tx(&self, ctx: &CommitTxContext) -> (Transaction, Vec<usize>) {
            let tx = Transaction {
                version: 2,
                lock_time: 0,
                input: vec![],
                output: vec![TxOut {
                    value: ctx.cstate.side(Side::Ours).pay_msat / 1000,
                    script_pubkey: Script::new(),
                }],
            };
            (tx, vec![0])
        }

        fn build_close_tx(&self, ctx: &CloseTxContext) -> Transaction {
            Transaction {
                version: 2,
                lock_time: 0,
                input: vec![],
                output: vec![TxOut {
                    value: ctx.local_amount_sat,
                    script_pubkey: ctx.local_script_pubkey.clone(),
                }],
            }
        }
    }

    struct StubSigner;

    impl ChainSigner for StubSigner {
        fn sign_theircommit(&self, _tx: &Transaction) -> Signature {
            fixed_sig()
        }

        fn sign_mutual_close(&self, _tx: &Transaction) -> Signature {
            fixed_sig()
        }

        fn verify_tx_sig(
            &self,
            _tx: &Transaction,
            _witness_script: &Script,
            _pubkey: &PublicKey,
            _sig: &Signature,
        ) -> bool {
            true
        }
    }

    struct StubTimers;

    impl TimerService for StubTimers {
        fn schedule(&self, _after: Duration, _what: TimerKind) {}
    }

    fn fixed_sig() -> Signature {
        let secp = Secp256k1::signing_only();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let msg = secp256k1::Message::from_slice(&[1u8; 32]).unwrap();
        secp.sign_ecdsa(&msg, &sk)
    }

    fn pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn make_peer(offer_anchor: AnchorOffer) -> Peer<StubFactory, StubSigner, StubTimers> {
        let limits = ChannelLimits {
            rel_locktime_max: 1_000_000,
            anchor_confirms_max: 100,
            commitment_fee_rate_min: 1,
        };
        let secrets = PeerSecrets { shachain_seed: [1u8; 32] };
        Peer::new(
            limits,
            secrets,
            pubkey(2),
            pubkey(3),
            144,
            1,
            1000,
            offer_anchor,
            StubFactory,
            StubSigner,
            StubTimers,
        )
    }

    fn dummy_anchor() -> AnchorInfo {
        AnchorInfo {
            txid: Transaction {
                version: 2,
                lock_time: 0,
                input: vec![],
                output: vec![TxOut { value: 1_000_000, script_pubkey: Script::new() }],
            }
            .txid(),
            output_index: 0,
            satoshis: 1_000_000,
            witnessscript: Script::new(),
        }
    }

    fn open_funded_channel()
    -> (Peer<StubFactory, StubSigner, StubTimers>, Peer<StubFactory, StubSigner, StubTimers>) {
        let mut funder = make_peer(AnchorOffer::Will);
        let mut fundee = make_peer(AnchorOffer::Wont);

        let open_a = funder.queue_open();
        let open_b = fundee.queue_open();
        match open_a {
            Message::Open(o) => fundee.receive_open(o).unwrap(),
            _ => unreachable!(),
        }
        match open_b {
            Message::Open(o) => funder.receive_open(o).unwrap(),
            _ => unreachable!(),
        }

        let anchor = dummy_anchor();
        let anchor_msg = funder.queue_anchor(anchor, 1_000_000_000).unwrap();
        match anchor_msg {
            Message::OpenAnchor(a) => {
                fundee.receive_anchor(a, Script::new(), 1_000_000_000).unwrap()
            }
            _ => unreachable!(),
        }

        let sig_a = funder.queue_open_commit_sig();
        let sig_b = fundee.queue_open_commit_sig();
        match sig_a {
            Message::OpenCommitSig(s) => fundee.receive_open_commit_sig(s).unwrap(),
            _ => unreachable!(),
        }
        match sig_b {
            Message::OpenCommitSig(s) => funder.receive_open_commit_sig(s).unwrap(),
            _ => unreachable!(),
        }

        funder.queue_open_complete();
        fundee.queue_open_complete();
        (funder, fundee)
    }

    #[test]
    fn open_handshake_without_anchor_offer_clash_succeeds() {
        let (funder, fundee) = open_funded_channel();
        assert!(funder.local.commit.is_some());
        assert!(fundee.remote.commit.is_some());
    }

    #[test]
    fn mismatched_anchor_offer_is_rejected() {
        let mut a = make_peer(AnchorOffer::Will);
        let mut b = make_peer(AnchorOffer::Will);
        let open_a = a.queue_open();
        match open_a {
            Message::Open(o) => {
                let err = b.receive_open(o).unwrap_err();
                assert_eq!(err, ProtocolError::AnchorOfferMismatch);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn htlc_add_then_fulfill_round_trips_through_revocation() {
        let (mut funder, mut fundee) = open_funded_channel();

        let add = funder.queue_htlc_add(500_000, 600_000, sha256::Hash::hash(b"preimage")).unwrap();
        let id = match &add {
            Message::UpdateAddHtlc(u) => u.id,
            _ => unreachable!(),
        };
        match add {
            Message::UpdateAddHtlc(u) => fundee.receive_htlc_add(u).unwrap(),
            _ => unreachable!(),
        }

        let commit = funder.queue_commit().unwrap();
        match commit {
            Message::UpdateCommit(c) => fundee.receive_commit(c).unwrap(),
            _ => unreachable!(),
        }
        let rev = fundee.queue_revocation();
        match rev {
            Message::UpdateRevocation(r) => funder.receive_revocation(r).unwrap(),
            _ => unreachable!(),
        }

        // The HTLC the funder staged is now mirrored into the funder's own
        // local staging (it arrived there via the revocation replay).
        assert!(funder.local.staging().htlc_by_id(id, Side::Ours).is_some());
    }

    #[test]
    fn consecutive_commits_without_revocation_are_rejected() {
        let (mut funder, mut fundee) = open_funded_channel();

        let add = funder.queue_htlc_add(10_000, 1000, sha256::Hash::hash(b"a")).unwrap();
        match add {
            Message::UpdateAddHtlc(u) => fundee.receive_htlc_add(u).unwrap(),
            _ => unreachable!(),
        }
        let commit = funder.queue_commit().unwrap();
        match commit {
            Message::UpdateCommit(c) => fundee.receive_commit(c).unwrap(),
            _ => unreachable!(),
        }

        // A second change is staged, but the first commit has not yet been
        // revoked: a second `UpdateCommit` must be rejected on both sides.
        let add2 = funder.queue_htlc_add(10_000, 1000, sha256::Hash::hash(b"b")).unwrap();
        match add2 {
            Message::UpdateAddHtlc(u) => fundee.receive_htlc_add(u).unwrap(),
            _ => unreachable!(),
        }
        assert_eq!(funder.queue_commit().unwrap_err(), ProtocolError::DoubleCommit);

        let second_commit_sig = UpdateCommit { sig: fixed_sig() };
        assert_eq!(fundee.receive_commit(second_commit_sig).unwrap_err(), ProtocolError::DoubleCommit);
    }

    #[test]
    fn messages_before_anchor_setup_are_rejected_not_panicked() {
        let mut fundee = make_peer(AnchorOffer::Wont);
        let err = fundee
            .receive_htlc_add(UpdateAddHtlc {
                id: 0,
                amount_msat: 1000,
                r_hash: [0u8; 32],
                expiry: 1000,
                route: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err, ProtocolError::ChannelNotEstablished);
    }

    #[test]
    fn dispatch_routes_htlc_add_and_reports_error_as_message() {
        let (mut funder, mut fundee) = open_funded_channel();
        let add = funder.queue_htlc_add(10_000, 1000, sha256::Hash::hash(b"c")).unwrap();
        assert!(fundee.dispatch(add.clone(), None).is_none());

        let dup = match add {
            Message::UpdateAddHtlc(u) => u,
            _ => unreachable!(),
        };
        let reply = fundee.dispatch(Message::UpdateAddHtlc(dup), None);
        match reply {
            Some(Message::Error(e)) => assert_eq!(e.problem, ProtocolError::DuplicateHtlcId(0).problem()),
            _ => panic!("expected an Error reply for a duplicate HTLC id"),
        }
    }

    #[test]
    fn duplicate_htlc_id_is_rejected() {
        let (mut funder, mut fundee) = open_funded_channel();
        let add = funder.queue_htlc_add(10_000, 1000, sha256::Hash::hash(b"x")).unwrap();
        let u = match add {
            Message::UpdateAddHtlc(u) => u,
            _ => unreachable!(),
        };
        fundee.receive_htlc_add(u.clone()).unwrap();
        let err = fundee.receive_htlc_add(u).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateHtlcId(0));
    }
}
