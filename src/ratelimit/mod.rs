mod domain;
mod guard;
mod store;
mod window;

pub use domain::*;
pub use guard::*;
pub use store::*;
pub use window::*;
