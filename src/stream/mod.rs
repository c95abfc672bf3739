// =============================================================================
// Streaming Layer
// =============================================================================
//
// Authenticated websocket session, its watchdog, and topic routing.

pub mod auth;
pub mod connection;
pub mod events;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod topic;
pub mod transport;

pub use connection::{ConnectionSettings, MarketDataConnection, SubscribeOutcome};
pub use monitor::{BackoffPolicy, ConnectionMonitor, MonitorSettings, ResubscribeReport};
pub use registry::{Callback, SubscriptionRegistry};
pub use router::MessageRouter;
pub use topic::Topic;
pub use transport::{Transport, TungsteniteTransport};
