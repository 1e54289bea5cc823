pub mod error;
pub mod message;
pub mod ops;

pub use error::*;
pub use message::*;
pub use ops::*;
