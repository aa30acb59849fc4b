// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # spacey-common
//!
//! CommonJS compatibility modules for the Spacey runtime: blocking-style I/O
//! over the tokio event loop.
//!
//! The crate is built from three pieces:
//!
//! - **Fibers** ([`runtime::fiber`]): logical call stacks that park at an I/O
//!   boundary and are resumed, with a value or an error, by the event source
//! - **Streams** ([`io`]): raw platform streams, in-memory streams and
//!   charset-aware text streams behind one interface
//! - **Binary values** ([`binary`]): `ByteString` and `ByteArray` sharing
//!   storage until the first mutation
//!
//! The [`modules`] for files, subprocesses and sockets hand out those streams.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spacey_common::modules::fs;
//! use spacey_common::runtime::fiber;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> spacey_common::Result<()> {
//!     fiber::run(async {
//!         let text = fs::read_text("notes.txt", None).await?;
//!         println!("{}", text);
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binary;
pub mod config;
pub mod error;
pub mod io;
pub mod modules;
pub mod runtime;

// Re-exports
pub use binary::{Binary, ByteArray, ByteString, Charset};
pub use config::Config;
pub use error::{CommonError, Result};
pub use io::{AnyStream, IoStream, MemoryStream, RawStream, Stream, TextStream};
pub use runtime::{Fiber, System};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
