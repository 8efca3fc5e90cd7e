//! Embeddable client-side monitoring agent.
//!
//! Host applications open [`Session`]s and report actions, events, errors
//! and web-request traces; the agent encodes everything into an in-memory
//! beacon cache and ships it to a monitoring cluster in compact chunks.
//! Two background workers keep the system bounded and moving: an eviction
//! worker caps cache size and record age, and a sending worker drives a
//! state machine through cluster time sync, status polling and beacon
//! transmission with retry, backoff and graceful shutdown.
//!
//! ```no_run
//! use capturoor::{Agent, Config};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut agent = Agent::new(Config {
//!     endpoint_url: "https://tenant.example.com/mbeacon".into(),
//!     application_id: "my-app".into(),
//!     device_id: 42,
//!     ..Default::default()
//! })?;
//! agent.start();
//!
//! let session = agent.create_session();
//! let action = session.enter_action("load dashboard");
//! action.report_int_value("widgets", 12);
//! action.leave_action();
//! session.end();
//!
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod protocol;
pub mod providers;
pub mod sender;
pub mod session;

pub use agent::Agent;
pub use config::{CacheConfig, Config, DeviceConfig, ServerFlavor, TrustMode};
pub use session::action::{Action, RootAction};
pub use session::web_request::WebRequestTracer;
pub use session::Session;
