//! I/O Actor Module
//!
//! One actor per open file. The actor is the only owner of the file handle
//! and applies requests strictly in submission order on its own thread.
//!
//! ## Responsibilities
//! - Serialize every read/write/sync of one file through a FIFO queue
//! - Report failures to the caller (no internal retries)
//! - Allow withdrawal of a request while it is still queued
//!
//! ## Request Lifecycle
//! ```text
//!   submit ──► Queued ──► InFlight ──► Completed
//!                │                 └─► Failed
//!                └─(cancel)──► Cancelled
//! ```
//!
//! Every on-disk location is named by an [`IoAddress`]; nothing outside this
//! module touches a `File`.

mod actor;
mod address;

pub use actor::{IoActor, IoHandle, IoOp, IoReply, RequestState, Ticket};
pub use address::{FileId, IoAddress, ADDRESS_SIZE};
