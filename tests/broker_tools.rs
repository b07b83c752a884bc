//! Tool brokering: catalogue discovery, correlated invocation from inside
//! an llm-tools node, collision handling, structured tool errors, transport
//! loss recovery, and the HTTP transport against a mock server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use httpmock::prelude::*;
use serde_json::json;

use hivegraph::broker::{
    BrokerError, HttpTransport, RequestFrame, ToolBroker, ToolReply, ToolTransport, TransportError,
};
use hivegraph::graph::NodeType;
use hivegraph::recorder::MemorySink;
use hivegraph::runtime::{Runtime, RuntimeConfig};
use hivegraph::scheduler::RunState;
use hivegraph::errors::ErrorKind;

fn tools_graph(tools: &[&str]) -> hivegraph::graph::Graph {
    let mut ask = node("ask", NodeType::LlmTools);
    ask.input_keys = strings(&["q"]);
    ask.output_keys = strings(&["answer"]);
    ask.tools = strings(tools);
    ask.system_prompt = Some("Answer {q} using the tools.".to_string());
    graph(vec![ask], vec![], &[("start", "ask")], &[], &["ask"])
}

#[tokio::test]
async fn tool_call_round_trip_with_correlation() {
    let broker = Arc::new(ToolBroker::new(Duration::from_secs(5)));
    let transport = Arc::new(EchoTransport::new("alpha", &["search"]));
    let registration = broker
        .register_with_transport("alpha", transport.clone())
        .await
        .unwrap();
    assert_eq!(registration.tools.len(), 1);
    assert!(registration.shadowed.is_empty());

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let llm = Arc::new(ScriptedLlm::new(vec![
        tool_call_msg("call-1", "search", json!({ "query": "rust runtimes" })),
        set_output_msg("call-2", "answer", json!("found it")),
        assistant_text("done"),
    ]));
    let runtime = Runtime::builder(tools_graph(&["search"]))
        .with_sink(sink.clone())
        .with_llm(llm)
        .with_broker(broker)
        .with_config(RuntimeConfig::default().with_state_dir(dir.path()))
        .build();

    let report = runtime.run(payload(&[("q", json!("which runtime?"))])).await;
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.output, json!({ "answer": "found it" }));

    // Exactly one invocation frame, echoing the model's call id.
    assert_eq!(transport.invocation_count(), 1);
    assert_eq!(transport.correlation_ids(), vec!["call-1".to_string()]);
}

#[tokio::test]
async fn structured_tool_error_is_observable_not_fatal() {
    let broker = Arc::new(ToolBroker::new(Duration::from_secs(5)));
    let transport = Arc::new(EchoTransport::new("alpha", &["search"]).failing("search"));
    broker
        .register_with_transport("alpha", transport.clone())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let llm = Arc::new(ScriptedLlm::new(vec![
        tool_call_msg("c1", "search", json!({ "query": "x" })),
        set_output_msg("c2", "answer", json!("worked around it")),
        assistant_text("done"),
    ]));
    let runtime = Runtime::builder(tools_graph(&["search"]))
        .with_sink(sink.clone())
        .with_llm(llm)
        .with_broker(broker)
        .with_config(RuntimeConfig::default().with_state_dir(dir.path()))
        .build();

    let report = runtime.run(payload(&[("q", json!("x"))])).await;
    assert_eq!(report.state, RunState::Completed);
    assert!(
        problems(&sink.snapshot())
            .iter()
            .any(|p| p.kind == Some(ErrorKind::ToolError))
    );
}

#[tokio::test]
async fn unpermitted_tool_is_refused_in_band() {
    let broker = Arc::new(ToolBroker::new(Duration::from_secs(5)));
    let transport = Arc::new(EchoTransport::new("alpha", &["search", "delete_all"]));
    broker
        .register_with_transport("alpha", transport.clone())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let llm = Arc::new(ScriptedLlm::new(vec![
        // The node only permits `search`.
        tool_call_msg("c1", "delete_all", json!({})),
        set_output_msg("c2", "answer", json!("stayed safe")),
        assistant_text("done"),
    ]));
    let runtime = Runtime::builder(tools_graph(&["search"]))
        .with_sink(sink.clone())
        .with_llm(llm)
        .with_broker(broker)
        .with_config(RuntimeConfig::default().with_state_dir(dir.path()))
        .build();

    let report = runtime.run(payload(&[("q", json!("x"))])).await;
    assert_eq!(report.state, RunState::Completed);
    // The refused call never reached the server.
    assert_eq!(transport.invocation_count(), 0);
}

#[tokio::test]
async fn name_collision_first_registration_wins() {
    let broker = ToolBroker::new(Duration::from_secs(5));
    let first = Arc::new(EchoTransport::new("alpha", &["search"]));
    let second = Arc::new(EchoTransport::new("beta", &["search", "fetch"]));

    broker
        .register_with_transport("alpha", first.clone())
        .await
        .unwrap();
    let registration = broker
        .register_with_transport("beta", second.clone())
        .await
        .unwrap();
    assert_eq!(registration.shadowed, vec!["search".to_string()]);

    let reply = broker.invoke("search", json!({}), "cid-1").await.unwrap();
    let ToolReply::Result(value) = reply else {
        panic!("expected a result");
    };
    assert_eq!(value["server"], "alpha");
    assert_eq!(first.invocation_count(), 1);
    assert_eq!(second.invocation_count(), 0);

    // `fetch` still routes to its only owner.
    broker.invoke("fetch", json!({}), "cid-2").await.unwrap();
    assert_eq!(second.invocation_count(), 1);
}

#[tokio::test]
async fn unregister_removes_catalogue_entries() {
    let broker = ToolBroker::new(Duration::from_secs(5));
    broker
        .register_with_transport("alpha", Arc::new(EchoTransport::new("alpha", &["search"])))
        .await
        .unwrap();
    assert_eq!(broker.list_tools(None).await.unwrap().len(), 1);

    broker.unregister("alpha").await.unwrap();
    assert!(broker.list_tools(None).await.unwrap().is_empty());
    assert!(matches!(
        broker.invoke("search", json!({}), "cid").await,
        Err(BrokerError::UnknownTool { .. })
    ));
    assert!(matches!(
        broker.unregister("alpha").await,
        Err(BrokerError::UnknownServer { .. })
    ));
}

#[tokio::test]
async fn duplicate_server_names_are_rejected() {
    let broker = ToolBroker::new(Duration::from_secs(5));
    broker
        .register_with_transport("alpha", Arc::new(EchoTransport::new("a", &["search"])))
        .await
        .unwrap();
    assert!(matches!(
        broker
            .register_with_transport("alpha", Arc::new(EchoTransport::new("b", &["fetch"])))
            .await,
        Err(BrokerError::DuplicateServer { .. })
    ));
}

#[tokio::test]
async fn transport_loss_gets_one_reconnect() {
    let broker = ToolBroker::new(Duration::from_secs(5));
    let transport = Arc::new(EchoTransport::new("alpha", &["search"]));
    broker
        .register_with_transport("alpha", transport.clone())
        .await
        .unwrap();

    transport.lose_next_call();
    let reply = broker.invoke("search", json!({}), "cid-1").await.unwrap();
    assert!(matches!(reply, ToolReply::Result(_)));
    assert_eq!(
        transport
            .reconnects
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // The lost attempt was dropped before recording; only the retry landed.
    assert_eq!(transport.invocation_count(), 1);
}

#[tokio::test]
async fn per_call_deadline_expires() {
    use async_trait::async_trait;
    use hivegraph::broker::{FrameOp, ReplyFrame};

    struct SlowTransport;

    #[async_trait]
    impl ToolTransport for SlowTransport {
        async fn handshake(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn request(&self, frame: RequestFrame) -> Result<ReplyFrame, TransportError> {
            if frame.op == FrameOp::Invoke {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(ReplyFrame {
                id: frame.id,
                result: Some(json!({ "tools": [tool_schema("search")] })),
                error: None,
            })
        }

        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    let broker = ToolBroker::new(Duration::from_millis(50));
    broker
        .register_with_transport("slow", Arc::new(SlowTransport))
        .await
        .unwrap();

    assert!(matches!(
        broker.invoke("search", json!({}), "cid").await,
        Err(BrokerError::Timeout { .. })
    ));
}

#[tokio::test]
async fn http_transport_round_trips_frames() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc");
            then.status(200).json_body(json!({
                "id": "fixed-id",
                "result": { "ok": true }
            }));
        })
        .await;

    let transport =
        HttpTransport::new(server.url("/rpc"), &rustc_hash::FxHashMap::default()).unwrap();
    let reply = transport
        .request(RequestFrame::invoke("fixed-id", "search", json!({ "q": 1 })))
        .await
        .unwrap();
    assert_eq!(reply.id, "fixed-id");
    assert_eq!(reply.result, Some(json!({ "ok": true })));
    mock.assert_async().await;
}

#[tokio::test]
async fn http_transport_rejects_mismatched_correlation() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc");
            then.status(200).json_body(json!({
                "id": "someone-elses-id",
                "result": {}
            }));
        })
        .await;

    let transport =
        HttpTransport::new(server.url("/rpc"), &rustc_hash::FxHashMap::default()).unwrap();
    let err = transport
        .request(RequestFrame::invoke("my-id", "search", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::CorrelationMismatch { .. }));
}

#[tokio::test]
async fn http_transport_surfaces_server_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc");
            then.status(500);
        })
        .await;

    let transport =
        HttpTransport::new(server.url("/rpc"), &rustc_hash::FxHashMap::default()).unwrap();
    let err = transport
        .request(RequestFrame::invoke("id", "search", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Http { .. }));
}
