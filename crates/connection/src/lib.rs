//! Persistent multiplexed HTTP/2 connection agent.
//!
//! [`Agent`] owns one long-lived connection to a fixed deployment host and
//! issues authenticated JSON requests over it from any number of concurrent
//! tasks. Connection faults are recorded out-of-band by a driver task and
//! repaired lazily on the next send.

pub mod agent;

pub use agent::{Agent, AgentError, Endpoint, RequestBody, Response};
