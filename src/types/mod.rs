mod audit;
mod models;
mod permission;

pub use audit::*;
pub use models::*;
pub use permission::*;
