//! Lifecycle interface for background services owned by the node bootstrap.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;

/// Boxed error returned by lifecycle transitions.
pub type BootError = Box<dyn std::error::Error + Send + Sync>;

/// A service the process bootstrap starts once and shuts down on exit.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Spawn the service's background work. Calling it twice is an error.
    async fn start(&self) -> Result<(), BootError>;

    /// Stop background work, leaving persisted state consistent.
    async fn shutdown(&self) -> Result<(), BootError>;

    /// Resolve once the service has stopped.
    async fn wait(&self);
}
