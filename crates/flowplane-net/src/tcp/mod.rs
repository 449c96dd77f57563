mod reactor;
mod stream;

pub use mio::Token;
pub use reactor::{PollEvent, Reactor};
pub use stream::ConnState;
