//! mordor-http — pipelined HTTP/1.x client on the mordor fiber runtime.
//!
//! Requests submitted to a [`ClientConnection`] are written to the wire
//! in submission order and their responses are consumed in the same
//! order (strict HTTP/1.1 pipelining). Body I/O flows through
//! [`Stream`](mordor::Stream)-shaped views whose EOF is the message
//! boundary.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mordor::stream::TcpStream;
//! use mordor_http::{ClientConnection, Request};
//!
//! fn get() -> Result<(), mordor_http::HttpError> {
//!     let stream = Arc::new(TcpStream::connect("example.com:80")?);
//!     let conn = ClientConnection::new(stream);
//!     let req = conn.request(Request::get("/").header("Host", "example.com"))?;
//!     let response = req.response()?;
//!     println!("{}", response.status);
//!     req.finish()?;
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod client;
pub mod conn;
pub mod error;
pub mod headers;
pub mod request;
pub mod response;

/// Body framing selector (RFC 7230 §3.3.3).
pub use body::Framing;
/// Pipelining client over one stream.
pub use client::ClientConnection;
/// One in-flight request/response pair.
pub use client::ClientRequest;
/// Writable request body view.
pub use client::RequestBody;
/// Readable response body view.
pub use client::ResponseBody;
/// Framed message I/O over a stream.
pub use conn::Connection;
/// Client errors.
pub use error::HttpError;
/// Ordered, case-insensitive header fields.
pub use headers::Headers;
/// HTTP protocol version.
pub use headers::Version;
/// Request head.
pub use request::Request;
/// Response head.
pub use response::Response;
