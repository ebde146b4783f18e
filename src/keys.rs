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

//! Per-channel key material and the 2-of-2 anchor (spec §3 `AnchorInfo`).

use bitcoin::Txid;

/// The funding (anchor) output opening the channel: a 2-of-2 multisig
/// between both commit keys.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct AnchorInfo {
    pub txid: Txid,
    pub output_index: u32,
    pub satoshis: u64,
    pub witnessscript: bitcoin::blockdata::script::Script,
}

/// Per-channel key material private to this node: the seed from which
/// our own revocation preimages are derived (spec §4.4). Signing itself
/// is delegated to [`crate::collaborators::ChainSigner`], since the
/// private keys backing it live in the wallet, outside this crate's
/// scope.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct PeerSecrets {
    pub shachain_seed: [u8; 32],
}

impl PeerSecrets {
    pub fn revocation_preimage(&self, commit_num: u64) -> [u8; 32] {
        crate::shachain::derive_from_seed(&self.shachain_seed, commit_num)
    }

    pub fn revocation_hash(&self, commit_num: u64) -> [u8; 32] {
        use bitcoin_hashes::Hash;
        bitcoin_hashes::sha256::Hash::hash(&self.revocation_preimage(commit_num)).into_inner()
    }
}
