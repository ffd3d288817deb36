//! frontrank-ctl - the control plane
//!
//! Long-lived command/broadcast surface over IPC (Unix socket) and TCP:
//!
//! - [`Message`] / [`Command`] / [`CmdResult`] - line-delimited JSON wire
//!   model with session-monotonic msg ids
//! - [`Handler`] - per-transport listener with session demultiplexing
//! - [`CtlServer`] - command fan-in, executor, broadcast fan-out
//! - [`CtlClient`] - client counterpart with local pub/sub demultiplexing
//!
//! Commands mutate the attached `LatencyClient` and the plugin registry;
//! every published ranking is broadcast to all connected clients.

mod client;
mod client_ipc;
mod client_tcp;
mod cmd;
mod error;
mod exec;
mod handler;
mod handler_ipc;
mod handler_tcp;
mod message;
mod server;

pub use client::{
    wait_result, CtlClient, LoopHook, ResultHandler, StateHandler,
};
pub use client_ipc::{connect_uri, IpcCtlClient};
pub use client_tcp::TcpCtlClient;
pub use cmd::{CmdResult, Command, ResultKey};
pub use error::{Error, Result};
pub use handler::{Handler, INGRESS_TIMEOUT};
pub use handler_ipc::{IpcCtlHandler, IPC_CLIENT_KEY};
pub use handler_tcp::TcpCtlHandler;
pub use message::{Message, MsgType};
pub use server::{CtlServer, HandlerInfo, HandlerSetConfig, CONTROLLER_REPORTER};
