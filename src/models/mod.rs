pub mod connector;
pub mod proxy;

pub use connector::*;
pub use proxy::*;
