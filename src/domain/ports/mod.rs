//! Ports: interfaces the executor consumes from its host.

pub mod approval;
pub mod handler;
pub mod observer;
pub mod provider;

pub use approval::{ApprovalWaiter, NotifyWaiter};
pub use handler::{DeterministicHandler, HandlerInvocation, HandlerRegistry};
pub use observer::{NoopObserver, RunObserver};
pub use provider::{MapProviderRegistry, Provider, ProviderRegistry};
