// Each integration test file is compiled as its own binary crate, each
// pulling in its own copy of this module. Helpers used by some test
// binaries but not others trigger false "dead code" warnings in the
// binaries that don't call them.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use triple_core::{
    CallPattern, Client, MessageCodec, MethodDescriptor, Server, ServerBuilder, Status,
};

static LOG_INIT: Once = Once::new();

/// Route runtime diagnostics through the test harness once per binary.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub const SERVICE: &str = "org.apache.dubbo.samples.HelloWorld";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatRequest {
    pub text: String,
    pub count: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountReply {
    pub count: u32,
    pub joined: String,
}

pub fn say_hello() -> MethodDescriptor<HelloRequest, HelloReply> {
    MethodDescriptor::new(
        SERVICE,
        "SayHello",
        CallPattern::Unary,
        MessageCodec::json(),
        MessageCodec::json(),
        "json",
    )
}

pub fn count_words() -> MethodDescriptor<String, CountReply> {
    MethodDescriptor::new(
        SERVICE,
        "CountWords",
        CallPattern::ClientStream,
        MessageCodec::json(),
        MessageCodec::json(),
        "json",
    )
}

pub fn repeat() -> MethodDescriptor<RepeatRequest, HelloReply> {
    MethodDescriptor::new(
        SERVICE,
        "Repeat",
        CallPattern::ServerStream,
        MessageCodec::json(),
        MessageCodec::json(),
        "json",
    )
}

pub fn echo() -> MethodDescriptor<String, String> {
    MethodDescriptor::new(
        SERVICE,
        "Echo",
        CallPattern::BidiStream,
        MessageCodec::json(),
        MessageCodec::json(),
        "json",
    )
}

/// A builder pre-loaded with the standard test service.
pub fn greeter_builder() -> ServerBuilder {
    init_logging();
    ServerBuilder::new()
        .unary(&say_hello(), |ctx, req: HelloRequest| {
            if req.name == "fail-not-found" {
                return Err(Status::not_found(format!("no greeting for {}", req.name)));
            }
            let token = ctx
                .request_metadata()
                .get("x-token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let message = match token {
                Some(token) => format!("Hello, {} ({token})", req.name),
                None => format!("Hello, {}", req.name),
            };
            Ok(HelloReply { message })
        })
        .client_streaming(&count_words(), |_ctx, requests| {
            let mut words = Vec::new();
            for item in requests {
                words.push(item.map_err(|e| e.status())?);
            }
            Ok(CountReply {
                count: words.len() as u32,
                joined: words.join(","),
            })
        })
        .server_streaming(&repeat(), |_ctx, req: RepeatRequest, sink| {
            for i in 0..req.count {
                if req.delay_ms > 0 {
                    std::thread::sleep(Duration::from_millis(req.delay_ms));
                }
                sink.send(&HelloReply {
                    message: format!("{} #{i}", req.text),
                })
                .map_err(|e| e.status())?;
            }
            Ok(())
        })
        .bidi_streaming(&echo(), |_ctx, requests, sink| {
            for item in requests {
                let value = item.map_err(|e| e.status())?;
                sink.send(&value).map_err(|e| e.status())?;
            }
            Ok(())
        })
}

pub fn start_greeter() -> Server {
    greeter_builder()
        .serve("127.0.0.1:0")
        .expect("failed to start test server")
}

pub fn reference_url(server: &Server) -> String {
    format!("tri://{}/{SERVICE}", server.local_addr())
}

pub fn connect(server: &Server) -> Client {
    Client::connect(&reference_url(server)).expect("failed to build client")
}
