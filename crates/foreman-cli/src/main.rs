use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use foreman_core::dispatcher::Dispatcher;
use foreman_core::domain::{Event, EventKind, ListenerId, TaskStatus};
use foreman_core::error::TaskError;
use foreman_core::listener::Listener;

/// Listener printing the task lifecycle to stdout.
struct PrintListener {
    id: ListenerId,
}

#[async_trait::async_trait]
impl Listener for PrintListener {
    fn id(&self) -> &ListenerId {
        &self.id
    }

    async fn notify(&self, event: Event) {
        match event {
            Event::TaskExecuteStart { task, .. } => {
                println!("started: {} (attempt {})", task.name(), task.attempts());
            }
            Event::TaskExecuteStop {
                task, value, error, ..
            } => {
                println!(
                    "stopped: {} status={:?} value={:?} error={:?}",
                    task.name(),
                    task.status(),
                    value,
                    error
                );
            }
            other => println!("event: {:?}", other),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // (A) a dispatcher with two execution slots
    let dispatcher = Dispatcher::new();
    dispatcher.add_simple_worker().expect("fresh worker id");
    dispatcher.add_simple_worker().expect("fresh worker id");

    // (B) watch the lifecycle
    let listener = Arc::new(PrintListener {
        id: ListenerId::new("listener-print"),
    });
    dispatcher.add_listener(EventKind::TaskExecuteStart, listener.clone());
    dispatcher.add_listener(EventKind::TaskExecuteStop, listener.clone());

    // (C) a task that fails twice before succeeding, retried up to 3 times
    let greet = dispatcher.add_named_task_fn(
        "greet",
        |ctx| async move {
            if ctx.attempt() < 3 {
                return Err(TaskError::Failed(format!(
                    "not ready yet (attempt={})",
                    ctx.attempt()
                )));
            }
            let name = ctx.args().first().and_then(Value::as_str).unwrap_or("world");
            Ok(Value::String(format!("hello, {name}!")))
        },
        vec![Value::from("foreman")],
    );
    greet.set_repeats(3);

    // (D) a task that sleeps past its deadline
    let slow = dispatcher.add_named_task_fn(
        "slow",
        |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        },
        vec![],
    );
    slow.set_timeout(Duration::from_millis(200));

    // (E) run until both tasks are terminal, then shut down
    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    loop {
        let done = [&greet, &slow]
            .iter()
            .all(|task| task.status().is_terminal());
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!(
        "final: greet={:?} attempts={} / slow={:?} last_error={:?}",
        greet.status(),
        greet.attempts(),
        slow.status(),
        slow.last_error()
    );
    assert_eq!(greet.status(), TaskStatus::Success);

    dispatcher.cancel().expect("cancel dispatcher");
    runner.await.expect("join runner").expect("clean shutdown");
}
