//! Dockerdriver
//!
//! A Docker Engine API client core for transports the usual HTTP stacks don't
//! speak: unix domain sockets and windows named pipes (plus plain TCP, with
//! optional TLS). On top of the transports sit a small pooled HTTP/1.1 client,
//! a typed invocation layer, API version negotiation, and a decoder for the
//! framing Docker uses to multiplex container stdio over one byte stream.
//!
//! ```no_run
//! # use dockerdriver::{Client, ConnectionDescriptor};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor: ConnectionDescriptor = "unix:///var/run/docker.sock".parse()?;
//! let client = Client::open(descriptor).await?;
//!
//! let mut logs = client.logs("my-container", Default::default()).await?;
//! while let Some(mut fragment) = logs.next_fragment().await? {
//!     let mut text = String::new();
//!     tokio::io::AsyncReadExt::read_to_string(&mut fragment, &mut text).await?;
//!     println!("{:?}: {}", fragment.stdio(), text);
//! }
//! logs.close().await;
//! client.close();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod body;
pub mod client;
pub mod config;
pub mod error;
pub mod stream;
pub mod transport;
pub mod version;

pub use body::Body;
pub use client::negotiate::negotiate_version;
pub use client::Client;
pub use config::{ConfigError, ConnectionDescriptor};
pub use error::{Error, InvocationError, InvocationErrorKind};
pub use stream::{Fragment, Stdio, StreamHandle};
pub use version::ApiVersion;

/// Boxed error type used where the concrete source is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
