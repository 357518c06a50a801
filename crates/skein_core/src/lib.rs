pub mod config;
pub mod error;
pub mod tools;

pub use config::SkeinConfig;
pub use error::Error;
pub use tools::{ToolCall, ToolDescriptor, ToolInputSchema, ToolResult};
