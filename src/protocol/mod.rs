pub mod beacon;
pub mod client;
pub mod response;

/// Version of the beacon wire protocol spoken by this agent.
pub const PROTOCOL_VERSION: i32 = 3;

/// Agent technology type reported to the cluster.
pub const AGENT_TECHNOLOGY_TYPE: &str = "okrust";

/// Agent version reported to the cluster.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
