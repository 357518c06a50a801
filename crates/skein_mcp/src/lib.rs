pub mod connection;
pub mod registry;

pub use connection::{
    ChildProcessLauncher, ConnectionStatus, ServerConnection, ServerLauncher, ServerTransport,
};
pub use registry::ToolRegistry;
