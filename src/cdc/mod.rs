pub mod client;
pub mod consumer;

pub use client::{CdcClient, RowEvent, RowEventType};
pub use consumer::{Consumer, ConsumerManager, ConsumerSpec, TableFilter, TriggerConsumer};
