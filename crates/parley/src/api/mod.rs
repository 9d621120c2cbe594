//! Rpc surface: the method catalog, param schemas, and dispatch.

pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod schema;

pub use dispatch::{dispatch, HandlerContext};
pub use registry::{Method, MethodRegistry, ALL_METHODS};
