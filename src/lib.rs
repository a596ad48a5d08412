//! A stackful fiber runtime with cooperative, epoll-driven I/O.
//!
//! The pieces, bottom up:
//! - [fiber](fiber/index.html): stackful coroutines with their own guarded
//!   stacks and a strict one-running-per-thread discipline,
//! - [scheduler](scheduler/index.html): a pool of worker threads consuming
//!   one FIFO of fibers and closures,
//! - [timer](timer/index.html): an ordered deadline set with condition
//!   timers,
//! - [ioman](ioman/index.html): the I/O scheduler: epoll, a self-pipe, and
//!   per-fd waiter records on top of the scheduler and the timers,
//! - [hook](hook/index.html): POSIX-shaped syscalls that suspend the calling
//!   fiber instead of the thread,
//! - [sync](sync/index.html): condition variables and semaphores that park
//!   fibers, not threads,
//! - [socket](socket/index.html) / [stream](stream/index.html): the
//!   application-facing socket API.
//!
//! Linux only: readiness comes from epoll in edge-triggered mode.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate serde;

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod ioman;
pub mod log;
pub mod scheduler;
pub mod socket;
pub mod stream;
pub mod sync;
pub mod timer;
