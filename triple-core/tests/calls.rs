//! End-to-end call tests over real sockets: the four call patterns,
//! deadlines, cancellation, and status propagation.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    connect, count_words, echo, repeat, say_hello, start_greeter, CountReply, HelloReply,
    HelloRequest, RepeatRequest,
};
use triple_core::{CallOptions, CallPattern, Code, MessageCodec, MethodDescriptor, ServerBuilder, Status, TripleError};

fn wait_for(flag: &AtomicBool, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    flag.load(Ordering::SeqCst)
}

#[test]
fn unary_happy_path() {
    let server = start_greeter();
    let client = connect(&server);
    let reply = client
        .unary(
            &say_hello(),
            &HelloRequest {
                name: "world".into(),
            },
            CallOptions::default(),
        )
        .expect("unary call");
    assert_eq!(reply.message, "Hello, world");
}

#[test]
fn unary_propagates_error_status() {
    let server = start_greeter();
    let client = connect(&server);
    let err = client
        .unary(
            &say_hello(),
            &HelloRequest {
                name: "fail-not-found".into(),
            },
            CallOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.status().message(), "no greeting for fail-not-found");
}

#[test]
fn unary_carries_request_metadata() {
    let server = start_greeter();
    let client = connect(&server);
    let reply = client
        .unary(
            &say_hello(),
            &HelloRequest { name: "dev".into() },
            CallOptions::default().with_metadata("x-token", "s3cr3t"),
        )
        .expect("unary call");
    assert_eq!(reply.message, "Hello, dev (s3cr3t)");
}

#[test]
fn unknown_method_is_unimplemented() {
    let server = start_greeter();
    let client = connect(&server);
    let missing: MethodDescriptor<HelloRequest, HelloReply> = MethodDescriptor::new(
        common::SERVICE,
        "NoSuchMethod",
        CallPattern::Unary,
        MessageCodec::json(),
        MessageCodec::json(),
        "json",
    );
    let err = client
        .unary(
            &missing,
            &HelloRequest { name: "x".into() },
            CallOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[test]
fn codec_mismatch_is_unimplemented() {
    let server = start_greeter();
    let client = connect(&server);
    // Same path, but claiming proto payloads.
    let wrong_codec: MethodDescriptor<HelloRequest, HelloReply> = MethodDescriptor::new(
        common::SERVICE,
        "SayHello",
        CallPattern::Unary,
        MessageCodec::json(),
        MessageCodec::json(),
        "proto",
    );
    let err = client
        .unary(
            &wrong_codec,
            &HelloRequest { name: "x".into() },
            CallOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[test]
fn pattern_mismatch_is_rejected_locally() {
    let server = start_greeter();
    let client = connect(&server);
    let err = client
        .server_streaming(
            &say_hello(),
            &HelloRequest { name: "x".into() },
            CallOptions::default(),
        )
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, TripleError::IllegalState(_)));
}

#[test]
fn repeated_calls_reuse_the_connection() {
    let server = start_greeter();
    let client = connect(&server);
    for i in 0..5 {
        let reply = client
            .unary(
                &say_hello(),
                &HelloRequest {
                    name: format!("caller-{i}"),
                },
                CallOptions::default(),
            )
            .expect("unary call");
        assert_eq!(reply.message, format!("Hello, caller-{i}"));
    }
}

#[test]
fn unary_deadline_cancels_client_and_handler() {
    let handler_cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&handler_cancelled);
    let server = ServerBuilder::new()
        .unary(&say_hello(), move |ctx, req: HelloRequest| {
            if ctx.wait_cancelled_timeout(Duration::from_secs(2)) {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(HelloReply {
                message: format!("late hello to {}", req.name),
            })
        })
        .serve("127.0.0.1:0")
        .expect("server");
    let client = connect(&server);

    let started = Instant::now();
    let err = client
        .unary(
            &say_hello(),
            &HelloRequest { name: "w".into() },
            CallOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    // The caller came back at the deadline, not at handler completion.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(
        wait_for(&handler_cancelled, Duration::from_secs(2)),
        "handler never observed cancellation"
    );
}

#[test]
fn client_stream_counts_messages_in_order() {
    let server = start_greeter();
    let client = connect(&server);
    let mut call = client
        .client_streaming(&count_words(), CallOptions::default())
        .expect("open call");
    for word in ["a", "b", "c", "d"] {
        call.send(&word.to_string()).expect("send");
    }
    let reply: CountReply = call.close_and_recv().expect("response");
    assert_eq!(reply.count, 4);
    assert_eq!(reply.joined, "a,b,c,d");
}

#[test]
fn server_stream_delivers_messages_then_ends() {
    let server = start_greeter();
    let client = connect(&server);
    let source = client
        .server_streaming(
            &repeat(),
            &RepeatRequest {
                text: "tick".into(),
                count: 5,
                delay_ms: 0,
            },
            CallOptions::default(),
        )
        .expect("open call");
    let messages: Vec<String> = source
        .map(|item| item.expect("stream item").message)
        .collect();
    assert_eq!(messages, ["tick #0", "tick #1", "tick #2", "tick #3", "tick #4"]);
}

#[test]
fn server_stream_cancellation_reaches_the_handler() {
    let handler_stopped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&handler_stopped);
    let server = ServerBuilder::new()
        .server_streaming(&repeat(), move |ctx, req: RepeatRequest, sink| {
            for i in 0..req.count {
                if ctx.is_cancelled() {
                    flag.store(true, Ordering::SeqCst);
                    return Err(Status::cancelled("consumer went away"));
                }
                std::thread::sleep(Duration::from_millis(req.delay_ms));
                if sink
                    .send(&HelloReply {
                        message: format!("#{i}"),
                    })
                    .is_err()
                {
                    flag.store(true, Ordering::SeqCst);
                    return Err(Status::cancelled("consumer went away"));
                }
            }
            Ok(())
        })
        .serve("127.0.0.1:0")
        .expect("server");
    let client = connect(&server);

    let mut source = client
        .server_streaming(
            &repeat(),
            &RepeatRequest {
                text: "m".into(),
                count: 50,
                delay_ms: 20,
            },
            CallOptions::default(),
        )
        .expect("open call");

    for _ in 0..2 {
        source.next().expect("message").expect("ok item");
    }
    source.cancel();

    // After cancellation no further message is user-visible.
    match source.next() {
        Some(Err(err)) => assert_eq!(err.code(), Code::Cancelled),
        other => panic!("expected a terminal error, got {other:?}"),
    }
    assert!(source.next().is_none());
    assert!(
        wait_for(&handler_stopped, Duration::from_secs(3)),
        "handler never observed the cancellation"
    );
}

#[test]
fn bidi_echo_round_trips_in_order() {
    let server = start_greeter();
    let client = connect(&server);
    let (mut sink, source) = client
        .bidi_streaming(&echo(), CallOptions::default())
        .expect("open call");
    let inputs = ["hello", "world", "from", "dubbo"];
    for word in inputs {
        sink.send(&word.to_string()).expect("send");
    }
    sink.close();
    let outputs: Vec<String> = source.map(|item| item.expect("stream item")).collect();
    assert_eq!(outputs, inputs);
}

#[test]
fn bidi_halves_close_independently() {
    let server = start_greeter();
    let client = connect(&server);
    let (mut sink, mut source) = client
        .bidi_streaming(&echo(), CallOptions::default())
        .expect("open call");

    // Interleave: each request is answered before the next is sent.
    for word in ["one", "two"] {
        sink.send(&word.to_string()).expect("send");
        let back = source.next().expect("echo").expect("ok item");
        assert_eq!(back, word);
    }
    sink.close();
    assert!(source.next().is_none());
    assert_eq!(source.status().map(|s| s.code()), Some(Code::Ok));
}

#[test]
fn double_close_and_double_cancel_are_idempotent() {
    let server = start_greeter();
    let client = connect(&server);
    let (mut sink, source) = client
        .bidi_streaming(&echo(), CallOptions::default())
        .expect("open call");
    sink.close();
    sink.close();
    let err = sink.send(&"late".to_string()).unwrap_err();
    assert!(matches!(err, TripleError::IllegalState(_)));
    source.cancel();
    source.cancel();
    drop(source);
}
