//! Client Module
//!
//! Client side of the binary protocol.
//!
//! ## Architecture
//! ```text
//! ┌──────────────┐  execute   ┌─────────────┐  acquire  ┌──────────────┐
//! │ CacheClient  │───────────►│  Operation  │──────────►│ ChannelPool  │
//! │ RemoteCache  │◄───────────│ (checkpoint,│◄──────────│  per address │
//! └──────────────┘   result   │  slot)      │  release  └──────┬───────┘
//!                             └──────▲──────┘                  │
//!                                    │ decode_payload          │ owns
//!                             ┌──────┴──────┐                  │
//!                             │   Channel   │◄─────────────────┘
//!                             │ reader loop │
//!                             └─────────────┘
//! ```

mod channel;
mod completion;
mod operation;
mod pool;
mod remote;

pub use channel::Channel;
pub use operation::{Operation, OperationHandle, OperationState};
pub use pool::ChannelPool;
pub use remote::{CacheClient, RemoteCache};
