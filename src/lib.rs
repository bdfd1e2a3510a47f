//! Symmetric client/server runtime for the Model Context Protocol
//!
//! This crate implements the shared protocol engine both sides of an MCP
//! connection run on: a bidirectional JSON-RPC 2.0 multiplexer with typed
//! method wrappers for the full capability surface (tools, prompts,
//! resources, sampling, elicitation, logging, roots, completion).
//!
//! # Architecture
//!
//! - **[`protocol`]**: JSON-RPC 2.0 frame types and MCP method definitions
//! - **[`session`]**: the protocol multiplexer shared by both roles:
//!   request correlation, progress, cancellation, timeouts, debouncing
//! - **[`client`]**: the host role, with tool-output schema enforcement and
//!   the elicitation handler gate
//! - **[`server`]**: the provider role, with version negotiation, log-level
//!   filtering, and the elicitation subsystem
//! - **[`capabilities`]**: the per-method capability gate
//! - **[`transport`]**: the transport contract and the in-memory pair
//! - **[`validator`]**: the JSON Schema validation contract
//! - **[`completion`]**: completable metadata for prompt arguments
//! - **[`error`]**: error handling for protocol operations
//!
//! # Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                               |
//!   |-- initialize ---------------->|
//!   |<------------- initialize -----|
//!   |-- notifications/initialized ->|
//!   |                               |
//!   |-- tools/list ---------------->|
//!   |<-------------- tools list ----|
//!   |                               |
//!   |<------- elicitation/create ---|
//!   |-- result (accept/decline) --->|
//! ```
//!
//! Once both sides are Ready, either peer can initiate requests and either
//! peer can cancel an in-flight request.
//!
//! # Example
//!
//! ```rust,no_run
//! use tandem_mcp::client::McpClient;
//! use tandem_mcp::protocol::{ClientCapabilities, ClientInfo};
//! use tandem_mcp::transport::TransportFactory;
//!
//! # async fn example() -> tandem_mcp::Result<()> {
//! let (client_transport, _server_transport) = TransportFactory::in_memory_pair();
//!
//! let client = McpClient::new(
//!     ClientInfo {
//!         name: "example-client".to_string(),
//!         version: "1.0.0".to_string(),
//!         title: None,
//!     },
//!     ClientCapabilities::default(),
//! );
//! // In real usage the other end of the transport is a connected server.
//! client.connect(client_transport).await?;
//! let tools = client.list_tools(None).await?;
//! println!("{} tools", tools.tools.len());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod completion;
pub mod elicitation;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod validator;


pub use client::{ClientOptions, McpClient};
pub use error::{Error, Result};
pub use server::{McpServer, ServerOptions};
pub use session::{
    CancelSignal, ConnectionState, NotificationOptions, RequestContext, RequestOptions, Session,
    SessionOptions,
};
