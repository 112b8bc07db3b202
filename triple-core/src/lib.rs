//! Core runtime for the Triple RPC protocol.
//!
//! Triple is wire-compatible with gRPC-over-HTTP/2 and additionally
//! accepts plain HTTP/JSON invocation of unary methods. This crate
//! provides the protocol state machine, a synchronous client and server
//! built around a single-threaded network event loop, and client-side
//! service discovery with load balancing over a pluggable registry.
//!
//! # Calling a service
//!
//! ```no_run
//! use triple_core::{CallOptions, CallPattern, Client, MessageCodec, MethodDescriptor};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct HelloRequest { name: String }
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct HelloReply { message: String }
//!
//! # fn main() -> triple_core::Result<()> {
//! let say_hello = MethodDescriptor::new(
//!     "org.apache.dubbo.samples.HelloWorld",
//!     "SayHello",
//!     CallPattern::Unary,
//!     MessageCodec::<HelloRequest>::json(),
//!     MessageCodec::<HelloReply>::json(),
//!     "json",
//! );
//! let client = Client::connect("tri://127.0.0.1:50051/org.apache.dubbo.samples.HelloWorld")?;
//! let reply = client.unary(
//!     &say_hello,
//!     &HelloRequest { name: "world".into() },
//!     CallOptions::default(),
//! )?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```
//!
//! Call APIs are blocking and must stay off the event loop; server
//! handlers run on a dedicated pool and may block freely.

mod call;
mod client;
mod codec;
mod config;
mod context;
mod deadline;
mod descriptor;
mod directory;
mod endpoint;
mod error;
mod framing;
mod loadbalance;
mod registry;
mod router;
mod runtime;
mod server;
mod status;
mod stream;
mod transport;
mod url;

pub use client::{Client, ClientStreamCall};
pub use codec::{DeserializeFn, MessageCodec, SerializeFn};
pub use config::{ClientConfig, ServerConfig, DEFAULT_QUEUE_CAPACITY};
pub use context::{CallOptions, Cancellation, ServerContext};
pub use deadline::{decode_grpc_timeout, encode_grpc_timeout, Deadline, GRPC_TIMEOUT};
pub use descriptor::{CallPattern, MethodDescriptor};
pub use directory::{Directory, Snapshot};
pub use endpoint::{Endpoint, EndpointMetadata};
pub use error::{Result, TripleError};
pub use framing::{encode_frame, Frame, FrameDecoder, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_LEN};
pub use loadbalance::LoadBalance;
pub use registry::{Lease, Listener, MemoryRegistry, Registry, ServiceKey, Subscription};
#[cfg(feature = "zookeeper")]
pub use registry::ZookeeperRegistry;
pub use runtime::Driver;
pub use server::{Server, ServerBuilder};
pub use status::{Code, Status, GRPC_MESSAGE, GRPC_STATUS};
pub use stream::{MessageSink, MessageSource};
pub use url::{
    decode_znode_name, encode_znode_name, endpoint_from_url, endpoint_to_url, RpcUrl, UrlOptions,
};
