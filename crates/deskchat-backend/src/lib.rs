pub mod driver;
pub mod mock;
pub mod session;
pub mod shim;

pub use driver::*;
pub use session::*;
pub use shim::*;
