mod channel;
mod frames;
mod message;
mod normalize;

pub use channel::*;
pub use frames::*;
pub use message::*;
pub use normalize::*;
