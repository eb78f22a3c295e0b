//! Model structure: the module tree, its parameters, and small reference
//! networks that drive the gradient-synchronization wrappers end to end.

pub mod linear;
pub mod module;
pub mod sequential;

pub use linear::Linear;
pub use module::{ModuleGraph, ModuleId, ModuleNode, Parameter};
pub use sequential::Sequential;
