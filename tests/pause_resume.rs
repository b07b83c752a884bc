//! Suspension and resumption: pause-node snapshots, forward resume entry
//! points, and transcript continuation for client-facing nodes.

mod common;

use std::sync::Arc;

use common::*;
use serde_json::{Value, json};

use hivegraph::errors::ErrorKind;
use hivegraph::graph::{EdgeCondition, NodeType};
use hivegraph::memory::InputView;
use hivegraph::recorder::MemorySink;
use hivegraph::runtime::{Runtime, RuntimeConfig};
use hivegraph::scheduler::RunState;
use hivegraph::snapshot::SnapshotStore;

fn intake_process_graph() -> hivegraph::graph::Graph {
    let mut intake = node("intake", NodeType::LlmTools);
    intake.input_keys = strings(&["topic"]);
    intake.system_prompt = Some("Clarify the request about {topic}.".to_string());
    intake.client_facing = true;
    let mut process = func_node("process", &["input"], &["result"]);
    process.nullable_keys = strings(&[]);
    graph(
        vec![intake, process],
        vec![edge("e1", "intake", "process", EdgeCondition::OnSuccess, 1)],
        &[("start", "intake"), ("intake_resume", "process")],
        &["intake"],
        &["process"],
    )
}

#[tokio::test]
async fn pause_then_forward_resume() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let llm = Arc::new(ScriptedLlm::new(vec![assistant_text(
        "Which aspect of the topic matters most?",
    )]));
    let runtime = Runtime::builder(intake_process_graph())
        .with_sink(sink.clone())
        .with_llm(llm)
        .with_config(RuntimeConfig::default().with_state_dir(dir.path()))
        .with_function_fn("process", |view: &InputView| {
            let answer = view.get("input").cloned().unwrap_or(Value::Null);
            let mut out = rustc_hash::FxHashMap::default();
            out.insert("result".to_string(), json!({ "processed": answer }));
            Ok(out)
        })
        .build();

    let report = runtime.run(payload(&[("topic", json!("t"))])).await;
    assert_eq!(report.state, RunState::Suspended);
    assert_eq!(report.current_node.as_deref(), Some("intake"));
    assert_eq!(report.output, json!("Which aspect of the topic matters most?"));

    // The snapshot is on disk and visible through status().
    let store = SnapshotStore::new(dir.path());
    let snapshot = store.load(&report.run_id).await.unwrap();
    assert_eq!(snapshot.pause_node, "intake");
    assert!(snapshot.transcript.is_some());
    let status = runtime.status(&report.run_id).await.unwrap();
    assert_eq!(status.state, RunState::Suspended);

    // Resume forwards into `process` with the reply under `input`.
    let resumed = runtime
        .resume(&report.run_id, json!({ "input": "answer" }))
        .await
        .unwrap();
    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(resumed.output, json!({ "result": { "processed": "answer" } }));

    // The finished run's snapshot directory is gone.
    assert!(store.load(&report.run_id).await.is_err());

    // The trace sequence continued across the suspension.
    let events = sink.snapshot();
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
    assert_eq!(run_ended_success(&events), Some(true));
}

#[tokio::test]
async fn client_facing_node_continues_its_transcript() {
    // The resume entry loops back to the pause node itself, so the parked
    // conversation continues with the reply appended.
    let mut chat = node("chat", NodeType::LlmTools);
    chat.input_keys = strings(&["topic"]);
    chat.output_keys = strings(&["summary"]);
    chat.client_facing = true;
    let g = graph(
        vec![chat],
        vec![],
        &[("start", "chat"), ("chat_resume", "chat")],
        &["chat"],
        &[],
    );

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let llm = Arc::new(ScriptedLlm::new(vec![
        assistant_text("What should the summary emphasize?"),
        set_output_msg("c1", "summary", json!("emphasis captured")),
        assistant_text("All set."),
    ]));
    let runtime = Runtime::builder(g)
        .with_sink(sink.clone())
        .with_llm(llm)
        .with_config(RuntimeConfig::default().with_state_dir(dir.path()))
        .build();

    let report = runtime.run(payload(&[("topic", json!("sync engines"))])).await;
    assert_eq!(report.state, RunState::Suspended);

    let resumed = runtime
        .resume(&report.run_id, json!("focus on conflict resolution"))
        .await
        .unwrap();
    // `chat` completed its loop; with no outgoing edges and no terminal
    // marking it suspends again only on client turns — here the loop ended
    // with committed outputs, but the node is not terminal, so the run
    // dead-ends.
    assert_eq!(resumed.state, RunState::Failed);
    assert_eq!(resumed.failure.as_ref().unwrap().kind, ErrorKind::DeadEnd);

    // The summary it committed was merged before the dead end was observed.
    let events = sink.snapshot();
    assert_eq!(completions_of(&events, "chat"), 1);
}

#[tokio::test]
async fn client_facing_multi_turn_to_terminal() {
    let mut chat = node("chat", NodeType::LlmTools);
    chat.input_keys = strings(&["topic"]);
    chat.output_keys = strings(&["summary"]);
    chat.client_facing = true;
    let done = func_node("done", &["summary"], &["archived"]);
    let g = graph(
        vec![chat, done],
        vec![edge("e1", "chat", "done", EdgeCondition::OnSuccess, 1)],
        &[("start", "chat"), ("chat_resume", "chat")],
        &["chat"],
        &["done"],
    );

    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlm::new(vec![
        assistant_text("First question?"),
        assistant_text("Second question?"),
        set_output_msg("c1", "summary", json!("two answers folded in")),
        assistant_text("Thanks, wrapping up."),
    ]));
    let runtime = Runtime::builder(g)
        .with_llm(llm)
        .with_config(RuntimeConfig::default().with_state_dir(dir.path()))
        .with_function_fn("done", |view: &InputView| {
            assert_eq!(
                view.get("summary"),
                Some(&json!("two answers folded in"))
            );
            let mut out = rustc_hash::FxHashMap::default();
            out.insert("archived".to_string(), json!(true));
            Ok(out)
        })
        .build();

    let first = runtime.run(payload(&[("topic", json!("t"))])).await;
    assert_eq!(first.state, RunState::Suspended);
    assert_eq!(first.output, json!("First question?"));

    let second = runtime.resume(&first.run_id, json!("answer one")).await.unwrap();
    assert_eq!(second.state, RunState::Suspended);
    assert_eq!(second.output, json!("Second question?"));

    let done_report = runtime.resume(&first.run_id, json!("answer two")).await.unwrap();
    assert_eq!(done_report.state, RunState::Completed);
    assert_eq!(done_report.output, json!({ "archived": true }));
}

#[tokio::test]
async fn resume_without_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::builder(intake_process_graph())
        .with_config(
            RuntimeConfig::default()
                .with_state_dir(dir.path())
                .without_stdout_events(),
        )
        .build();
    assert!(runtime.resume("run-missing", json!("hi")).await.is_err());
}

#[tokio::test]
async fn pause_function_node_snapshots_its_outputs() {
    // A non-client-facing pause node: suspension happens at the graph
    // boundary after the node commits.
    let gate = func_node("gate", &["topic"], &["question"]);
    let mut after = func_node("after", &["input"], &["result"]);
    after.input_keys = strings(&["input"]);
    let g = graph(
        vec![gate, after],
        vec![edge("e1", "gate", "after", EdgeCondition::OnSuccess, 1)],
        &[("start", "gate"), ("gate_resume", "after")],
        &["gate"],
        &["after"],
    );

    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::builder(g)
        .with_config(
            RuntimeConfig::default()
                .with_state_dir(dir.path())
                .without_stdout_events(),
        )
        .with_function_fn("gate", |_| {
            let mut out = rustc_hash::FxHashMap::default();
            out.insert("question".to_string(), json!("proceed?"));
            Ok(out)
        })
        .with_function_fn("after", |view: &InputView| {
            let mut out = rustc_hash::FxHashMap::default();
            out.insert("result".to_string(), view.get("input").cloned().unwrap_or(Value::Null));
            Ok(out)
        })
        .build();

    let report = runtime.run(payload(&[("topic", json!("t"))])).await;
    assert_eq!(report.state, RunState::Suspended);
    assert_eq!(report.output, json!({ "question": "proceed?" }));

    let store = SnapshotStore::new(dir.path());
    let snapshot = store.load(&report.run_id).await.unwrap();
    assert!(snapshot.transcript.is_none());
    assert_eq!(snapshot.pending, json!({ "question": "proceed?" }));

    let resumed = runtime.resume(&report.run_id, json!({ "input": "yes" })).await.unwrap();
    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(resumed.output, json!({ "result": "yes" }));
}
