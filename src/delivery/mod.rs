//! Per-channel delivery workers.
//!
//! Each worker pulls rendered notifications from its channel's delivery
//! subject, invokes the channel's transport adapter, persists an audit
//! row before acking, retries with backoff via broker redelivery, and
//! moves exhausted payloads to the DLQ. A consecutive-failure circuit
//! breaker pauses consumption when the transport looks down.

mod circuit_breaker;
mod transport;
mod worker;

pub use circuit_breaker::CircuitBreaker;
pub use transport::{
    default_transport, EmailTransport, InAppTransport, MockTransport, PushTransport, SmsTransport,
    Transport, TransportError, TransportReceipt,
};
pub use worker::DeliveryWorker;
