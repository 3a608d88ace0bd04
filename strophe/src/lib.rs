mod builder;
mod dispatch;
mod error;
mod fiber;
mod frame;
mod heap;
mod location;
mod object;
mod objects;
mod proc;
mod scheduler;
mod segment;
#[cfg(test)]
mod testing;
mod types;
mod value;
mod vm;
mod vtable;

pub use builder::*;
pub use dispatch::*;
pub use error::*;
pub use fiber::*;
pub use frame::*;
pub use heap::*;
pub use location::*;
pub use object::*;
pub use objects::*;
pub use proc::*;
pub use scheduler::*;
pub use segment::*;
pub use types::*;
pub use value::*;
pub use vm::*;
pub use vtable::*;
