//! SHV IoT - dispatch tree, RPC sessions and the tunneling broker.
//!
//! Builds on [`shv_chainpack`] for values and messages and adds everything
//! that touches a socket:
//!
//! - [`node`]: the [`ShvTree`] a device or broker serves requests from
//! - [`rpc`]: framing, the connection actor, login and [`ClientConnection`]
//! - [`broker`]: the TCP [`Broker`] with mounts, tunnels and subscriptions
//!
//! # Example
//!
//! ```rust,ignore
//! use shv_iot::{app_node, Broker, BrokerConfig, ClientConfig, ClientConnection, ShvTree};
//! use shv_iot::node::AccessLevel;
//!
//! #[tokio::main]
//! async fn main() -> shv_iot::Result<()> {
//!     let broker = Broker::start(
//!         BrokerConfig::new("127.0.0.1", 0).with_user("admin", "admin!", AccessLevel::Admin),
//!     )
//!     .await?;
//!
//!     let tree = ShvTree::new().with_node("", app_node("pump", Some("pump-1".into())))?;
//!     let _device = ClientConnection::connect_device(
//!         ClientConfig::new("127.0.0.1", broker.port)
//!             .with_user("admin", "admin!")
//!             .with_device("pump-1", Some("test/pump")),
//!         tree,
//!     )
//!     .await?;
//!
//!     let client = ClientConnection::connect(
//!         ClientConfig::new("127.0.0.1", broker.port).with_user("admin", "admin!"),
//!     )
//!     .await?;
//!     let name = client.call("test/pump", "appName", None).await?;
//!     println!("Device says it is {}", name);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod node;
pub mod rpc;

// Re-export commonly used types
pub use broker::{Broker, BrokerHandle, BrokerState};
pub use config::{BrokerConfig, ClientConfig, DeviceOptions, LoginType, RpcConfig, UserConfig};
pub use error::{Result, ShvError};
pub use node::{
    app_node, AccessLevel, CallContext, LocalFsNode, MetaMethod, MethodNode, ShvNode, ShvTree,
};
pub use rpc::{ClientConnection, ConnectionHandle, ConnectionState, RpcHandler};
