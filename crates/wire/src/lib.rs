pub mod channel;
pub mod delta;
pub mod error;
pub mod header;
pub mod message;
pub mod sched;
pub mod traits;
pub mod transport;

pub use channel::Queue;
pub use delta::{DeltaControls, DeltaEntry, DESIRED_CHANGE_SIGNATURE, MIN_UNIT_CHANGE_SIGNATURE};
pub use error::WireError;
pub use header::{ComHeader, MessageType, HEADER_LEN};
pub use message::{Envelope, Message, OocLoadCmd, PhaseMessage, ShardLoaded};
pub use sched::{chunk_count, entries_per_chunk, IdVal, SchedHead, SchedStartParams, SchedType};
pub use traits::Endpoint;
pub use transport::{link_pair, Link};
