//! Infrastructure adapters for the Flowline application ports.

#![forbid(unsafe_code)]

mod in_memory_queue_repository;
mod migration_runner;
mod postgres_queue_repository;
mod stderr_event_sink;
mod store_access;

pub use in_memory_queue_repository::InMemoryQueueRepository;
pub use migration_runner::{AppliedMigration, MigrationRunner, MigrationStatus, MigrationUnit};
pub use postgres_queue_repository::PostgresQueueRepository;
pub use stderr_event_sink::StderrEventSink;
pub use store_access::{StoreAccess, StoreName};
