#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod error;
mod looper;
mod scheduler;
mod timer;

pub use crate::cache::{
    AppDescriptor, CacheKey, ComponentIdent, KeyKind, OutlineCache, Releasable,
    ResolveDescriptor, WidgetProviderDescriptor,
};
pub use crate::error::IdentError;
pub use crate::looper::{EventLoop, EventLoopHandle, LoopCallback, LoopHandle};
pub use crate::scheduler::{Category, DeferredTaskScheduler, Task, TaskResult};
pub use crate::timer::{Timer, TimerListener};

/// Install a `tracing` subscriber reading its filter from the
/// environment. Meant for binaries and tests embedding this crate.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
