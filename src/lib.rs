#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod engine;
mod error;
#[cfg(feature = "logging")]
pub mod logging;
mod slug;
mod sync;
mod task;
pub mod tasks;
mod value;

pub use crate::engine::{
    Config, ContextId, Cx, DependencyTree, Engine, FnGuard, GraphNode, Guard, guard_scope,
};
pub use crate::error::*;
pub use crate::slug::{ABBREVIATE_LEN, Fingerprint, Slug, abbreviate};
pub use crate::sync::{Semaphore, SemaphoreGuard, TurnLock};
pub use crate::task::{Job, Registry, Task, TaskFuture, TaskOptions, register, stamp_output};
pub use crate::value::{Deferred, Entity, Stamped, Value};
