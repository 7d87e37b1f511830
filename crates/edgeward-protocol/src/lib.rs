//! Wire types shared by the edgeward orchestrator and its consumers

mod codec;
mod messages;

pub use codec::{CodecError, SseCodec};
pub use messages::{EventStatus, ProgressEvent, TlsStatus, UnknownTlsStatus, SIMULATION_MARKER};
