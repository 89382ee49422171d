pub mod field;
pub mod identity;
pub mod revision;
pub mod validate;
pub mod workspace;

pub use field::*;
pub use identity::*;
pub use revision::*;
pub use validate::*;
pub use workspace::*;
