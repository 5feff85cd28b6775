pub mod bridge;
pub mod client;
pub mod hub;

pub use bridge::{BridgeState, EventBridge};
pub use client::{ClientId, ClientRegistry};
pub use hub::{ConnectionHub, HubConfig, HubError, HubEvent};
