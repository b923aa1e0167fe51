mod message;
pub use message::*;

mod step;
pub use step::*;

mod turn;
pub use turn::*;

mod tool_call;
pub use tool_call::*;

mod trace;
pub use trace::*;
