pub mod executor;
pub mod handler;
pub mod registry;

pub use executor::ToolExecutor;
pub use handler::{ExecutionSite, ToolDef, ToolHandler};
pub use registry::{ToolRegistry, ToolResolution};
