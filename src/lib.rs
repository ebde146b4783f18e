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

//! Per-peer Lightning channel packet engine: a replicated two-party state
//! machine driving one channel from its opening handshake through HTLC
//! staging, commitment signing, revocation, and mutual close.
//!
//! Bitcoin transaction/script construction and wallet signing are external
//! collaborators injected through the traits in [`collaborators`]; this
//! crate owns only the protocol state and its invariants.

#![recursion_limit = "256"]
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_encoding;

#[cfg(feature = "serde")]
extern crate serde_crate as serde;

pub mod collaborators;
pub mod commit;
pub mod error;
pub mod htlc;
pub mod keys;
pub mod peer;
pub mod shachain;
pub mod staging;
pub mod wire;

pub use collaborators::{ChainSigner, CommitTxFactory, TimerKind, TimerService};
pub use commit::CommitInfo;
pub use error::{ChannelError, Fatal, ProtocolError};
pub use htlc::{ChannelState, Htlc, HtlcStaging, Side};
pub use keys::{AnchorInfo, PeerSecrets};
pub use peer::{ChannelLimits, ClosingInfo, Peer, PeerVisibleState};
pub use shachain::ShachainStore;
pub use wire::Message;
