//! # SalesRelay Broker
//!
//! The durable handoff between the daily firing and the downstream consumer.
//!
//! ```text
//! Publisher ──(confirm)──▶ daily_sales_report ──(prefetch N)──▶ Consumer ──▶ SummaryHandler
//!                                 │
//!                                 └── reject(requeue=false) ──▶ daily_sales_report.dead
//! ```
//!
//! Delivery is at-least-once. The publisher never resends once a message may
//! have reached the broker; the consumer bounds requeues and dead-letters the rest.

pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod retry;

pub use amqp::{AmqpDeliverySource, AmqpSettings, AmqpTransport};
pub use consumer::{Consumer, ConsumerSettings};
pub use memory::MemoryBroker;
pub use publisher::{Publisher, PublisherSettings};
pub use retry::ReconnectPolicy;
