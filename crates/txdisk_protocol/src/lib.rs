//! # txdisk protocol
//!
//! Message model for clients that drive an engine from another process.
//!
//! This crate provides:
//! - [`Request`] and [`Response`], one variant per remote call
//! - length-prefixed CBOR framing over any byte stream
//! - [`HostedObjects`], which maps `u32` handles to live sessions and streams
//! - [`Dispatcher`], which executes requests against an [`Engine`](txdisk_core::Engine)
//!
//! Transport is left to the caller: anything implementing `Read` and
//! `Write` can carry frames.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dispatch;
mod error;
mod frame;
mod handles;
mod message;

pub use dispatch::Dispatcher;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use handles::{Handle, HostedObjects};
pub use message::{ErrorKind, RemoteError, Request, Response};
