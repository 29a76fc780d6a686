pub mod attribution;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod host;
pub mod tree;
pub mod units;

pub use config::{Config, EngineConfig};
pub use engine::{EngineEvent, EngineHandle, Engine};
pub use error::{AppError, Result};
pub use tree::{build_tree, Node, NodeKind};
