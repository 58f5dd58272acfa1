pub mod ansi;
pub mod chat;
pub mod log_entry;
pub mod log_stream;
pub mod settings;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MCP_COMMAND: &str = "flyctl mcp server";

pub use ansi::{ansi_to_html, strip_ansi};
pub use chat::*;
pub use log_entry::*;
pub use log_stream::*;
pub use settings::*;
