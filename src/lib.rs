//! Queueing between a network stack and its interface drivers: priority
//! transmit queues with pluggable disciplines, token-bucket rate
//! regulation of dequeue, a mirrored receive queue decoupling driver
//! ingress from protocol processing, and a task serializer keeping a
//! queue's transmit-start logic single-threaded.
//!
//! None of the queue operations block; the only blocking calls are the
//! teardown barriers.

pub mod error;
pub mod ifiq;
pub mod ifq;
pub mod packet;
pub mod queue;
pub mod stats;
pub mod task;
pub mod tbr;

pub use error::{Error, Result};
pub use ifiq::{IfIqueue, RxFilter, RxHandler};
pub use ifq::{DeferredFree, DequeueRef, IfQueue, TransmitStart, DEFAULT_MAXLEN};
pub use packet::{Packet, PacketList, StdPacket, DEFAULT_PRIORITY, MAX_PRIORITY, NUM_PRIORITIES};
pub use queue::{Admission, DeqCookie, Discipline, PriorityQueue};
pub use stats::InterfaceStats;
pub use task::{Serializer, Task, TaskQueue};
pub use tbr::{Clock, ManualClock, MonotonicClock, TbrContext, TbrProfile, DEFAULT_TICK};
