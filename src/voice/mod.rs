//! Voice side of a guild session: Discord gateway payloads, the per-guild
//! voice connection state and the pooled voice-update payloads.

pub mod connection;
pub mod gateway;
pub mod pool;
