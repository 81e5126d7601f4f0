//! # Hashline - Peer-to-Peer Switch Library
//!
//! Hashline implements a peer-to-peer overlay switch: endpoints
//! identified by a self-certifying hashname exchange encrypted datagrams
//! over pluggable transports.
//!
//! - **Identity**: 32-byte hashnames derived from per-cipher-set key
//!   fingerprints
//! - **Lines**: at most one encrypted session per remote hashname,
//!   across any mix of transport paths
//! - **Channels**: typed sub-conversations inside a line, reliable or
//!   raw
//! - **NAT**: port-mapping discovery and maintenance so external
//!   addresses can be advertised
//! - **Bridging**: relay routing through intermediaries when direct
//!   paths are unusable, plus DHT-style seek discovery
//!
//! ## Architecture
//!
//! The codebase uses the actor pattern for all shared state: the switch
//! controller is a single task owning the peer table, the line map, and
//! the active-line index, addressed through a command mailbox with
//! reply channels. Each line runs its own small task; channels are pure
//! state machines driven by their line. External readers use atomic
//! counters instead of entering the mailbox.
//!
//! ## Quick Start
//!
//! ```ignore
//! let transport = Arc::new(UdpTransport::bind("0.0.0.0:0".parse()?).await?);
//! let switch = Switch::open(SwitchConfig::default(), transport).await?;
//!
//! // Exchange identities out of band, then:
//! switch.add_peer(remote_identity).await?;
//! let channel = switch.open_channel(remote_hashname, "ping", true).await?;
//! channel.write_packet(Packet::with_body(b"hello".to_vec())).await?;
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `switch` | Controller mailbox and the public `Switch` facade |
//! | `hashname` | Self-certifying identifiers and XOR metric |
//! | `cipherset` | CSID negotiation, opaque keys, handshake crypto |
//! | `packet` | Length-prefixed header/body wire framing |
//! | `transport` | Transport trait, UDP, firewall filter, in-process mesh |
//! | `nat` | Gateway port-mapping discovery and refresh |
//! | `peers` | Hashname-keyed k-bucket peer table |
//! | `line` | Per-peer session state machine and runner task |
//! | `channel` | Reliable and raw channel state machines |
//! | `bridge` | Relay routing for unreachable peers |
//! | `seek` | Closest-peer discovery queries |

pub mod channel;
pub mod cipherset;
pub mod error;
pub mod hashname;
pub mod line;
pub mod nat;
pub mod packet;
pub mod peers;
pub mod switch;
pub mod transport;

mod bridge;
mod seek;

pub use channel::{Channel, Listener};
pub use cipherset::{select_csid, Csid, Key, Keys, Parts, PrivateKeys, Token, CSID_3A};
pub use error::{Error, Result};
pub use hashname::Hashname;
pub use line::{LineHandle, LineState};
pub use nat::{NatDiscoverer, NatGateway, NatTransport};
pub use packet::{Header, Packet};
pub use peers::{Peer, PeerAddr};
pub use switch::{Switch, SwitchConfig, SwitchStats};
pub use transport::{Addr, FwTransport, Transport, UdpTransport};
