pub mod request;
pub mod result;
pub mod traffic;

pub use request::*;
pub use result::*;
pub use traffic::*;
