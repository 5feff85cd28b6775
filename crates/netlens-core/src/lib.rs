pub mod ids;
pub mod record;
pub mod wire;

pub use ids::{RequestId, TraceId};
pub use record::{Body, ErrorData, Headers, RequestRecord, ResponseData, TimingData};
pub use wire::{ClientCommand, Envelope, WireEvent};
