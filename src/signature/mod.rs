mod sig_type;
pub use sig_type::*;

mod parse;
pub use parse::*;

mod validate;
pub use validate::*;

mod schema;
pub use schema::*;

mod error;
pub use error::*;
