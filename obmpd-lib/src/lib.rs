//! Core of the obmpd BMP collector: framing, identity, envelope encoding,
//! topic resolution and the per-router pipeline. The daemon crate owns
//! sockets, configuration and the Kafka producer; everything here runs
//! against in-memory byte streams and channels, which is also how the
//! integration tests drive it.

pub mod bus;
pub mod envelope;
pub mod frame;
pub mod identity;
pub mod ring;
pub mod statistics;
pub mod topic;
pub mod worker;
