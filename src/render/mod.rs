mod strategy;
pub use strategy::*;

mod coalesced;
pub use coalesced::*;

mod windowed;
pub use windowed::*;
