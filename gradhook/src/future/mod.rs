//! Completion plumbing shared by hooks and the transport: a set-once
//! promise ([`AsyncHandle`]) and the opaque payload hooks resolve to
//! ([`HookValue`]).

mod handle;
mod value;

pub use handle::{AsyncHandle, HandleState};
pub use value::HookValue;
