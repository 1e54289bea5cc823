pub mod cache;
pub mod config;
pub mod facade;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod runtime;

pub use cache::*;
pub use config::*;
pub use facade::*;
pub use monitor::*;
pub use recovery::*;
pub use registry::*;
pub use runtime::*;
