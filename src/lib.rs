//! Concurrency and resource management core of the Ember rendering engine.
//!
//! Four subsystems, leaves first:
//!
//! * [`scheduler`] — worker threads driving a shared executor plus typed
//!   groups of serial strands giving each subsystem lock free serialization.
//! * [`assets`] — a validating parser turning the declarative asset database
//!   into typed descriptors, answering lookups by stable id.
//! * [`resource`] — a reference counted, lease issuing cache for CPU side
//!   blobs loaded asynchronously from files.
//! * [`device`] — the GPU object store: handle generation allocators with
//!   timeline semaphore gated deferred destruction, per frame command pool
//!   cycling and swapchain management.
//!
//! The [`server`] module orchestrates them into the asset → resource → GPU
//! object pipeline.

pub mod assets;
pub mod device;
pub mod error;
pub mod logging;
pub mod resource;
pub mod scheduler;
pub mod server;
pub mod util;

pub use error::Error;
