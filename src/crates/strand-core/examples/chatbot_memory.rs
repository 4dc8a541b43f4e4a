//! Chatbot that remembers each conversation thread
//!
//! Run with: RUST_LOG=strand_core=debug cargo run -p strand-core --example chatbot_memory
//!
//! Set `STRAND_CONFIG` to a TOML file to pick the backend, e.g.
//!
//! ```toml
//! [checkpointer]
//! backend = "sqlite"
//! path = "data/threads.db"
//! ```

use futures::StreamExt;
use serde_json::{json, Value};
use strand_core::{task, EngineConfig, Entrypoint, Final, RunConfig, StreamEvent, StreamMode};
use tracing_subscriber::EnvFilter;

fn reply_to(messages: &[Value]) -> String {
    let name = messages
        .iter()
        .filter_map(Value::as_str)
        .find_map(|m| m.strip_prefix("hi! I'm "));
    match (messages.last().and_then(Value::as_str), name) {
        (Some(last), Some(name)) if last.contains("name") => format!("Your name is {name}."),
        (_, Some(name)) => format!("Nice to meet you, {name}!"),
        _ => "Hello! Who am I talking to?".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::var("STRAND_CONFIG") {
        Ok(path) => EngineConfig::load(path).await?,
        Err(_) => EngineConfig::from_env()?,
    };
    let checkpointer = config.open_checkpointer().await?;

    let respond = task("respond", |messages| {
        Box::pin(async move {
            let history = messages.as_array().cloned().unwrap_or_default();
            Ok(json!(reply_to(&history)))
        })
    });

    let chatbot = Entrypoint::new("chatbot", move |input, previous, runtime| {
        let respond = respond.clone();
        Box::pin(async move {
            let mut messages = previous
                .and_then(|p| p.as_array().cloned())
                .unwrap_or_default();
            messages.push(input);
            let reply = runtime.submit(&respond, Value::Array(messages.clone())).await?;
            messages.push(reply.clone());
            Ok(Final::new(reply).with_save(Value::Array(messages)))
        })
    })
    .with_checkpointer(checkpointer)
    .with_config(config);

    println!("=== Thread 1 ===");
    for message in ["hi! I'm bob", "what's my name?"] {
        let reply = chatbot.invoke(json!(message), RunConfig::for_thread("1")).await?;
        println!("user: {message}\nbot:  {reply}");
    }

    println!("\n=== Thread 2 (streamed) ===");
    let mut events = chatbot
        .stream(
            json!("what's my name?"),
            RunConfig::for_thread("2"),
            [StreamMode::Tasks, StreamMode::Updates],
        )
        .await?;
    while let Some(chunk) = events.next().await {
        match chunk.event {
            StreamEvent::TaskStart { task_id, .. } => println!("[{}] started {task_id}", chunk.sequence),
            StreamEvent::Updates { node, update } => println!("[{}] {node}: {update}", chunk.sequence),
            StreamEvent::Error { error } => println!("[{}] failed: {error}", chunk.sequence),
            _ => {}
        }
    }

    println!("\n=== History of thread 1 ===");
    let mut history = chatbot
        .get_state_history(&RunConfig::for_thread("1"), Default::default())
        .await?;
    while let Some(tuple) = history.next().await {
        let tuple = tuple?;
        println!(
            "checkpoint {} (parent {:?}, source {:?})",
            tuple.checkpoint.id, tuple.checkpoint.parent_id, tuple.metadata.source
        );
    }

    Ok(())
}
