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

//! Staging & Changeset Manager (spec §4.2): replays a `CommitInfo`'s
//! `unacked_changes` against the staging snapshot on the other side once
//! that `CommitInfo` is revoked.

use crate::error::Fatal;
use crate::htlc::{ChannelState, HtlcStaging, Side};

/// Replays `changes` against `target`, from the point of view of
/// `side_perspective`: `Add` operations are applied against that side (the
/// side the HTLC was originally charged to), while `Fulfill`/`Fail`
/// operations target the *opposite* side, since a fulfill or fail always
/// resolves an HTLC the other party originated.
///
/// Any inconsistency — a duplicate id on add, or a missing id on
/// fulfill/fail — means the two parties' books have diverged; this is a
/// fatal protocol violation (spec §7 tier 2), not a recoverable one.
pub fn apply_changeset(
    target: &mut ChannelState,
    side_perspective: Side,
    changes: &[HtlcStaging],
) -> Result<(), Fatal> {
    for change in changes {
        match change {
            HtlcStaging::Add { htlc } => {
                if target.htlc_by_id(htlc.id, side_perspective).is_some() {
                    return Err(Fatal::ReplayInconsistency(format!(
                        "duplicate HTLC id {} on add",
                        htlc.id
                    )));
                }
                if target
                    .add_htlc(side_perspective, htlc.amount_msat, htlc.expiry, htlc.rhash, htlc.id)
                    .is_none()
                {
                    return Err(Fatal::ReplayInconsistency(format!(
                        "replaying add of HTLC {} failed",
                        htlc.id
                    )));
                }
            }
            HtlcStaging::Fulfill { id, .. } => {
                let index = target.htlc_by_id(*id, side_perspective.opposite()).ok_or_else(|| {
                    Fatal::ReplayInconsistency(format!("cannot fulfill non-existent HTLC {}", id))
                })?;
                target.fulfill_htlc(index, side_perspective.opposite());
            }
            HtlcStaging::Fail { id, .. } => {
                let index = target.htlc_by_id(*id, side_perspective.opposite()).ok_or_else(|| {
                    Fatal::ReplayInconsistency(format!("cannot fail non-existent HTLC {}", id))
                })?;
                target.fail_htlc(index, side_perspective.opposite());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin_hashes::{sha256, Hash};

    fn rhash(byte: u8) -> sha256::Hash {
        sha256::Hash::hash(&[byte])
    }

    #[test]
    fn replays_add_against_named_side() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        let htlc = crate::htlc::Htlc {
            id: 4,
            amount_msat: 50_000,
            rhash: rhash(9),
            expiry: 100,
            side: Side::Ours,
        };
        apply_changeset(&mut cstate, Side::Ours, &[HtlcStaging::Add { htlc }]).unwrap();
        assert!(cstate.htlc_by_id(4, Side::Ours).is_some());
    }

    #[test]
    fn replays_fulfill_against_opposite_side() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        cstate.add_htlc(Side::Ours, 50_000, 100, rhash(1), 4).unwrap();
        let r = rhash(2);
        apply_changeset(&mut cstate, Side::Theirs, &[HtlcStaging::Fulfill { id: 4, r }]).unwrap();
        assert!(cstate.htlc_by_id(4, Side::Ours).is_none());
        assert_eq!(cstate.side(Side::Ours).pay_msat, 1_000_000_000 + 50_000);
    }

    #[test]
    fn duplicate_add_is_fatal() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        cstate.add_htlc(Side::Ours, 50_000, 100, rhash(1), 4).unwrap();
        let htlc = crate::htlc::Htlc {
            id: 4,
            amount_msat: 10_000,
            rhash: rhash(3),
            expiry: 100,
            side: Side::Ours,
        };
        let result = apply_changeset(&mut cstate, Side::Ours, &[HtlcStaging::Add { htlc }]);
        assert!(matches!(result, Err(Fatal::ReplayInconsistency(_))));
    }

    #[test]
    fn missing_id_on_fail_is_fatal() {
        let mut cstate = ChannelState::new(1_000_000_000, 1_000_000_000, 1000);
        let result =
            apply_changeset(&mut cstate, Side::Theirs, &[HtlcStaging::Fail { id: 99, reason: vec![] }]);
        assert!(matches!(result, Err(Fatal::ReplayInconsistency(_))));
    }
}
