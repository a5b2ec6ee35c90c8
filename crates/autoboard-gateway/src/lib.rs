pub mod client;
pub mod stream;

pub use client::HttpGateway;
pub use stream::{spawn_event_stream, NdjsonDecoder};
