pub mod matcher;
pub mod server;

pub use matcher::*;
pub use server::*;
