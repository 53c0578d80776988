pub mod message;
pub mod session;
pub mod time;
pub mod wire;

pub use message::*;
pub use session::*;
pub use wire::*;
