//! Relay Worker - Entry Point
//!
//! Background worker that dispatches tasks from the shared queues.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_worker::run(relay_worker::default_registry()).await
}
