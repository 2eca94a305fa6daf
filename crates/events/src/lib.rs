//! Job status updates and the publishing seam between the dispatcher and
//! status consumers (the live subscription fanout, tests, future brokers).

pub mod bus;
pub mod in_memory_bus;
pub mod tenant;
pub mod update;

pub use bus::{StatusPublisher, Subscription};
pub use in_memory_bus::InMemoryStatusBus;
pub use tenant::TenantScoped;
pub use update::JobUpdate;
