mod mustache;
pub use mustache::*;

mod error;
pub use error::*;
