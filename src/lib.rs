//! quillmq: the core of an AMQP-style message broker queue.
//!
//! One queue is a single-threaded actor owning a variable queue, a tiered
//! residency engine that moves messages between in-memory and on-disk forms
//! under a live RAM budget. Dispatch to consumers is gated by per-channel
//! prefetch limits and per-consumer link credit; producers are paced by a
//! credit-flow ledger; file handles go through a soft-capped cache.

pub mod config;
pub mod core;
pub mod logging;

pub use crate::core::backing_queue::{AckTag, BackingQueue, TxnId};
pub use crate::core::error::{QueueError, Result};
pub use crate::core::message::{Message, MessageId, MessageProps};
pub use crate::core::queue::{ChannelEvent, ChannelHandle, QueueActor, QueueDecl, QueueHandle};
pub use crate::core::vq::VariableQueue;
pub use crate::core::{ChannelId, NodeId, QueueId, SeqId};
