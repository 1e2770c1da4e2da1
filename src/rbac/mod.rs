pub mod engine;
pub mod permission;

pub use engine::{RbacEngine, RbacError, RbacResult};
pub use permission::Permission;
