//! RPC transport: framing, the connection actor, login and client sessions.

mod client;
mod connection;
pub mod frame;
pub mod login;

pub use client::ClientConnection;
pub use connection::{Connection, ConnectionHandle, ConnectionState, RpcHandler};
pub use frame::{read_frame, write_frame, Frame, RpcStream};
pub use login::{LoginCredentials, LoginOptions, LoginRequest, PendingLogin};
