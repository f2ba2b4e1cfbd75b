//! Synchronization objects
//!
//! Message queues, counting semaphores, and mutexes with priority
//! inheritance. All three block through the shared wait-list protocol in
//! [`wait`]; the queue stores its payload in the [`ringbuf`] primitive.

pub mod mutex;
pub mod queue;
pub mod ringbuf;
pub mod sem;
pub mod wait;
