//! Plugin engine for managing tendril plugins.

mod backoff;
mod engine;
mod lifecycle;

pub use backoff::Backoff;
pub use engine::{EngineError, PluginEngine};
pub use lifecycle::{LifecycleCoordinator, LifecycleEvent, PluginRuntimeState, Transition};
