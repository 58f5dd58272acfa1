mod log;
mod provider;
mod tool;

pub use log::*;
pub use provider::*;
pub use tool::*;
