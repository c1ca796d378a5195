pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::{Attempt, ToolExecutor};
pub use registry::{Tool, ToolRegistry};
