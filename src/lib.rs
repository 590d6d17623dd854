//! efa-rdm - reliable datagram messaging over an EFA-style unreliable
//! datagram fabric.
//!
//! The underlying device offers only unreliable, unordered, MTU-limited
//! datagrams plus optional RDMA read. This crate layers a reliable,
//! ordered, arbitrarily-sized message service on top, with emulated
//! one-sided writes, reads and atomics.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Endpoint                               │
//! │  ┌──────────┐ ┌───────────────┐ ┌───────────────────────────┐  │
//! │  │ CompQueue│ │ AddressVector │ │ Packet pools (tx/rx/      │  │
//! │  │          │ │ AH cache +    │ │ unexpected/read-copy)     │  │
//! │  │          │ │ reverse map   │ │                           │  │
//! │  └──────────┘ └───────────────┘ └───────────────────────────┘  │
//! │  ┌──────────────────────┐  ┌─────────────────────────────────┐ │
//! │  │ TX/RX entry arenas   │  │ progress(): poll CQs, dispatch, │ │
//! │  │ + read entries       │  │ re-drive queues, pump windows   │ │
//! │  └──────────────────────┘  └─────────────────────────────────┘ │
//! └───────────────┬───────────────────────────┬────────────────────┘
//!                 ▼                           ▼
//!          ┌────────────┐             ┌────────────┐
//!          │ Transport  │             │ Transport  │
//!          │  (device)  │             │   (shm)    │
//!          └────────────┘             └────────────┘
//! ```
//!
//! - **Per-peer reliability**: a 32-bit msg_id sequence with a modular
//!   reorder window delivers messages in order per peer.
//! - **Flow control**: long transfers run a CTS/DATA credit loop; every
//!   CTS grants at least one packet.
//! - **QP-reuse safety**: every endpoint owns a random connection id
//!   carried in packet headers; traffic from a destroyed predecessor QP
//!   sharing GID and QPN is dropped.
//! - **Single-threaded cooperative**: application calls enqueue intent,
//!   [`Endpoint::progress`] does all the work, nothing blocks.

pub mod addr;
pub mod av;
pub mod config;
pub mod cq;
pub mod endpoint;
pub mod error;
pub mod hmem;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod read;
pub mod rx_entry;
pub mod sim;
pub mod transport;
pub mod tx_entry;

mod atomic;
mod ctrl;
mod msg;
mod progress;
mod rma;

pub use addr::{FiAddr, Gid, RawAddr};
pub use config::EndpointConfig;
pub use cq::{CompFlags, CqEntry, CqErrEntry};
pub use endpoint::{Endpoint, RmaRegion, SendOpts};
pub use error::{Error, Result};
pub use hmem::{HmemDesc, HmemIface};
pub use packet::{AtomicDatatype, AtomicOp, RmaIov};
pub use sim::{SimFabric, SimTransport};
pub use transport::Transport;
