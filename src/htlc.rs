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

//! Channel state and funding arithmetic (spec §4.1): the two balances, the
//! outstanding HTLCs charged against each of them, and the add/fulfill/fail
//! operations that mutate a [`ChannelState`] snapshot.

use bitcoin_hashes::sha256;

/// Which side of the channel a balance or HTLC belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, StrictEncode, StrictDecode)]
pub enum Side {
    /// The local node's side of the channel.
    #[display("ours")]
    Ours,
    /// The remote node's side of the channel.
    #[display("theirs")]
    Theirs,
}

impl Side {
    /// Returns the other side. A fulfill or fail always targets an HTLC
    /// originated by the opposite side from the one staging it (spec §4.2).
    pub fn opposite(self) -> Side {
        match self {
            Side::Ours => Side::Theirs,
            Side::Theirs => Side::Ours,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Ours => 0,
            Side::Theirs => 1,
        }
    }
}

/// Maximum number of outstanding HTLCs permitted on either side of either
/// commitment (spec §3 invariant 7).
pub const MAX_HTLCS_PER_SIDE: usize = 300;

/// A single outstanding hashed time-locked contract.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Htlc {
    pub id: u64,
    pub amount_msat: u64,
    pub rhash: sha256::Hash,
    /// Absolute expiry, in seconds; block-height expiries are rejected at
    /// the wire layer and never reach this type (spec §4.5).
    pub expiry: u32,
    /// Side whose balance this HTLC is charged against until it resolves.
    pub side: Side,
}

/// One party's balance and the HTLCs currently charged against it.
#[derive(Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode)]
pub struct ChannelSide {
    pub pay_msat: u64,
    pub htlcs: Vec<Htlc>,
}

/// The channel's full funding picture: both balances plus a monotonic
/// witness of "has anything changed since the last commit" (spec §3).
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelState {
    side: [ChannelSide; 2],
    /// Fee rate in satoshi per 1000 weight units, used to derive the
    /// commitment transaction's own fee (spec §4.1 "fee policy").
    pub feerate_per_kw: u32,
    /// Incremented on every add/fulfill/fail; the commit driver refuses to
    /// emit a commit when this has not moved since the predecessor (spec
    /// §4.3, §8 property 4).
    pub changes: u64,
}

/// Base weight of a commitment transaction with no HTLC outputs, matching
/// the widely used Lightning commitment-weight constant.
const BASE_COMMITMENT_WEIGHT: u64 = 724;

/// Marginal weight added to a commitment transaction by each HTLC output.
const HTLC_WEIGHT: u64 = 172;

impl ChannelState {
    pub fn new(local_msat: u64, remote_msat: u64, feerate_per_kw: u32) -> ChannelState {
        ChannelState {
            side: [
                ChannelSide { pay_msat: local_msat, htlcs: vec![] },
                ChannelSide { pay_msat: remote_msat, htlcs: vec![] },
            ],
            feerate_per_kw,
            changes: 0,
        }
    }

    pub fn side(&self, side: Side) -> &ChannelSide {
        &self.side[side.index()]
    }

    fn side_mut(&mut self, side: Side) -> &mut ChannelSide {
        &mut self.side[side.index()]
    }

    /// Funder of the channel pays the commitment fee; by BOLT-era
    /// convention that is always [`Side::Ours`] for an outbound-funded
    /// channel's local copy and mirrored on the peer's copy. We keep the
    /// payer explicit rather than hard-coding it so callers can model
    /// either direction having opened the channel.
    pub fn commitment_fee_msat(&self, num_htlcs: usize) -> u64 {
        let weight = BASE_COMMITMENT_WEIGHT + HTLC_WEIGHT * num_htlcs as u64;
        weight * self.feerate_per_kw as u64 / 1000 * 1000
    }

    /// Debits `amount_msat` from `side`'s balance unconditionally, refusing
    /// only if it would go negative. Used once, at channel open, to charge
    /// the funder the base commitment fee (spec §4.1 "fee policy").
    pub fn debit(&mut self, side: Side, amount_msat: u64) -> bool {
        if self.side(side).pay_msat < amount_msat {
            return false;
        }
        self.side_mut(side).pay_msat -= amount_msat;
        true
    }

    /// spec §4.1 `add_htlc`: inserts a new HTLC charged against `side`'s
    /// balance (after recomputing the commitment fee), returning `None`
    /// without mutating anything if the payer cannot afford the HTLC and
    /// the updated fee together.
    ///
    /// TODO: this recomputes the fee only against the current staging
    /// snapshot, not the last state the peer has acknowledged, mirroring a
    /// known gap in the original implementation this was derived from
    /// ("may have already added more txs... driving fee up").
    pub fn add_htlc(
        &mut self,
        side: Side,
        amount_msat: u64,
        expiry: u32,
        rhash: sha256::Hash,
        id: u64,
    ) -> Option<Htlc> {
        if amount_msat == 0 {
            return None;
        }

        let num_htlcs_after = self.side(side).htlcs.len() + 1;
        let fee_msat = self.commitment_fee_msat(num_htlcs_after);

        // `pay_msat` is already net of every previously staged HTLC on this
        // side, so only the new HTLC's amount (plus the updated fee) needs
        // to fit against it.
        let payer = self.side(side);
        if payer.pay_msat < amount_msat + fee_msat {
            return None;
        }

        let payer = self.side_mut(side);
        payer.pay_msat -= amount_msat;
        let htlc = Htlc { id, amount_msat, rhash, expiry, side };
        payer.htlcs.push(htlc.clone());
        self.changes += 1;
        Some(htlc)
    }

    /// spec §4.1 `fulfill_htlc`: removes the HTLC at `index` from `side`'s
    /// list and credits the opposite side's balance.
    pub fn fulfill_htlc(&mut self, index: usize, side: Side) {
        let htlc = self.side_mut(side).htlcs.remove(index);
        self.side_mut(side.opposite()).pay_msat += htlc.amount_msat;
        self.changes += 1;
    }

    /// spec §4.1 `fail_htlc`: removes the HTLC at `index`, restoring the
    /// amount to the originating side.
    pub fn fail_htlc(&mut self, index: usize, side: Side) {
        let htlc = self.side_mut(side).htlcs.remove(index);
        self.side_mut(side).pay_msat += htlc.amount_msat;
        self.changes += 1;
    }

    /// spec §4.1 `htlc_by_id`: linear lookup, O(n) with n ≤
    /// [`MAX_HTLCS_PER_SIDE`].
    pub fn htlc_by_id(&self, id: u64, side: Side) -> Option<usize> {
        self.side(side).htlcs.iter().position(|h| h.id == id)
    }

    /// Deep-copy for snapshotting into a `CommitInfo` (spec §4.1 `copy`).
    pub fn copy(&self) -> ChannelState {
        self.clone()
    }
}

/// A single staged-but-not-yet-committed HTLC operation (spec §3
/// `HtlcStaging`). Replayed against a staging snapshot by
/// [`crate::staging::apply_changeset`].
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub enum HtlcStaging {
    Add { htlc: Htlc },
    Fulfill { id: u64, r: sha256::Hash },
    Fail { id: u64, reason: Vec<u8> },
}

impl HtlcStaging {
    /// The HTLC id this operation concerns, used for replay lookups.
    pub fn id(&self) -> u64 {
        match self {
            HtlcStaging::Add { htlc } => htlc.id,
            HtlcStaging::Fulfill { id, .. } => *id,
            HtlcStaging::Fail { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rhash(byte: u8) -> sha256::Hash {
        use bitcoin_hashes::Hash;
        sha256::Hash::hash(&[byte])
    }

    #[test]
    fn add_htlc_debits_payer() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        let htlc = cstate.add_htlc(Side::Ours, 100_000, 500_000, rhash(1), 0).unwrap();
        assert_eq!(htlc.amount_msat, 100_000);
        assert_eq!(cstate.side(Side::Ours).pay_msat, 1_000_000_000 - 100_000);
        assert_eq!(cstate.changes, 1);
    }

    #[test]
    fn add_htlc_rejects_zero_amount() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        assert!(cstate.add_htlc(Side::Ours, 0, 500_000, rhash(1), 0).is_none());
        assert_eq!(cstate.changes, 0);
    }

    #[test]
    fn add_htlc_refuses_when_payer_cannot_afford() {
        let mut cstate = ChannelState::new(50_000, 1_000_000_000, 1000);
        assert!(cstate.add_htlc(Side::Ours, 100_000, 500_000, rhash(1), 0).is_none());
    }

    #[test]
    fn sequential_add_htlc_calls_do_not_double_count_prior_htlcs() {
        let mut cstate = ChannelState::new(1_000_000, 1_000_000, 0);
        assert!(cstate.add_htlc(Side::Ours, 400_000, 500_000, rhash(1), 0).is_some());
        assert!(cstate.add_htlc(Side::Ours, 400_000, 500_000, rhash(2), 1).is_some());
        assert_eq!(cstate.side(Side::Ours).pay_msat, 200_000);
        assert_eq!(cstate.side(Side::Ours).htlcs.len(), 2);
    }

    #[test]
    fn fulfill_htlc_credits_opposite_side() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        cstate.add_htlc(Side::Ours, 100_000, 500_000, rhash(1), 7).unwrap();
        let index = cstate.htlc_by_id(7, Side::Ours).unwrap();
        cstate.fulfill_htlc(index, Side::Ours);
        assert_eq!(cstate.side(Side::Theirs).pay_msat, 1_000_000_000 + 100_000);
        assert!(cstate.htlc_by_id(7, Side::Ours).is_none());
    }

    #[test]
    fn fail_htlc_restores_originator() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        cstate.add_htlc(Side::Ours, 100_000, 500_000, rhash(1), 7).unwrap();
        let index = cstate.htlc_by_id(7, Side::Ours).unwrap();
        cstate.fail_htlc(index, Side::Ours);
        assert_eq!(cstate.side(Side::Ours).pay_msat, 1_000_000_000);
    }
}
