//! Event delivery: connections, router and output channels

mod connection;
mod queue;
mod router;
mod sink;

pub use connection::{
    CloseCallback, CloseReason, ConnectionHooks, ConnectionOptions, ConnectionState,
    ConnectionStats, ErrorCallback, EventFilter, StreamConnection, TRANSPORT_ERROR_CODE,
};
pub use queue::{DeliveryQueue, FlushPlan, PushOutcome};
pub use router::{ConnectionRequest, RouterStatistics, StreamRouter};
pub use sink::{format_record, parse_records, ChannelSink, EventSink, SseRecord};
