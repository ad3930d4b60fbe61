//! `opsync`: command-line client for the shared task list and message stream.
//!
//! Each command opens the local stores, connects whatever transports are
//! configured, performs one operation, waits for in-flight remote writes,
//! and exits. `watch` keeps running until interrupted.
//!
//! ```bash
//! # Offline: local store only
//! cargo run --bin opsync -- --no-peer add "print 10 albums" --role printer
//!
//! # Against a relay
//! cargo run --bin opsync -- --remote-url ws://127.0.0.1:9000/ws tasks
//!
//! # Or via environment variables
//! OPSYNC_REMOTE_URL=ws://127.0.0.1:9000/ws OPSYNC_ROLE=printer cargo run --bin opsync -- watch
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use opsync::client::{self, SyncClient};
use opsync::config::{CliArgs, Command, SyncConfig};
use opsync::peer::PeerChannel;
use opsync::remote::RemoteStore;
use opsync::sync::SyncEvent;
use opsync_proto::{Message, Task, stamp};

/// How long one-shot commands wait for remote writes before exiting.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match SyncConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(user = %config.identity.user_id, "opsync starting");

    let client = match client::open(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error opening local store: {e}");
            return ExitCode::FAILURE;
        }
    };
    client.start().await;

    let command = cli.command.unwrap_or(Command::Tasks { role: None });
    let code = run(&client, command).await;

    if !client.settle(SETTLE_TIMEOUT).await {
        eprintln!("Warning: some remote writes did not finish; local copies are kept");
    }
    client.shutdown();
    tracing::info!("opsync exiting");
    code
}

/// Initialize file-based logging.
///
/// Logs go to a file so command output on stdout stays clean. Returns a
/// [`WorkerGuard`] that must be held until exit so buffered entries are
/// flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("opsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run<R: RemoteStore, P: PeerChannel>(client: &SyncClient<R, P>, command: Command) -> ExitCode {
    match command {
        Command::Tasks { role } => {
            let tasks = match role {
                Some(role) => client.tasks_for_role(&role),
                None => client.tasks(),
            };
            for task in &tasks {
                println!("{}", format_task(task));
            }
            ExitCode::SUCCESS
        }
        Command::Add {
            text,
            assignee,
            role,
        } => {
            let created_by = client.identity().user_id.clone();
            report(client.add_task(&text, &assignee, &role, Some(&created_by)), |t| {
                format_task(&t)
            })
        }
        Command::Toggle { id, open } => {
            let by = client.identity().user_id.clone();
            report(client.toggle_task(&id, !open, Some(&by)), |t| format_task(&t))
        }
        Command::Edit { id, text } => report(client.update_task(&id, &text), |t| format_task(&t)),
        Command::Delete { id } => {
            if client.delete_task(&id) {
                println!("deleted {id}");
                ExitCode::SUCCESS
            } else {
                eprintln!("Error: no task with id {id}");
                ExitCode::FAILURE
            }
        }
        Command::Messages { limit } => {
            let messages = client.messages();
            let skip = messages.len().saturating_sub(limit);
            for message in &messages[skip..] {
                println!("{}", format_message(message));
            }
            ExitCode::SUCCESS
        }
        Command::Send { content, to, kind } => {
            let sender = client.identity().clone();
            report(
                client.send_message(&content, &sender, to.as_deref(), kind),
                |m| format_message(&m),
            )
        }
        Command::Watch => {
            watch(client).await;
            ExitCode::SUCCESS
        }
    }
}

fn report<T, E: std::fmt::Display>(result: Result<T, E>, show: impl FnOnce(T) -> String) -> ExitCode {
    match result {
        Ok(value) => {
            println!("{}", show(value));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn watch<R: RemoteStore, P: PeerChannel>(client: &SyncClient<R, P>) {
    let tasks = client.subscribe_tasks(|event: &SyncEvent<Task>| match event {
        SyncEvent::Upsert(task) => println!("task  {}", format_task(task)),
        SyncEvent::Delete(id) => println!("task  deleted {id}"),
        SyncEvent::Sync => println!("task  list refreshed"),
    });
    let messages = client.subscribe_messages(|event: &SyncEvent<Message>| match event {
        SyncEvent::Upsert(message) => println!("msg   {}", format_message(message)),
        SyncEvent::Delete(id) => println!("msg   withdrawn {id}"),
        SyncEvent::Sync => println!("msg   history refreshed"),
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for interrupt");
    }
    tasks.unsubscribe();
    messages.unsubscribe();
}

fn format_task(task: &Task) -> String {
    let mark = if task.completed { "x" } else { " " };
    let done = task
        .completed_at
        .as_ref()
        .map(|at| {
            format!(
                " (done {} by {})",
                stamp::format(at),
                task.completed_by.as_deref().unwrap_or("?")
            )
        })
        .unwrap_or_default();
    format!(
        "[{mark}] {}  {}  @{} {}{done}",
        task.id, task.text, task.target_role_tag, task.assignee_label
    )
}

fn format_message(message: &Message) -> String {
    let to = message.recipient_id.as_deref().unwrap_or("group");
    format!(
        "{} {} -> {} [{}] {}",
        stamp::format(&message.created_at),
        message.sender_name,
        to,
        message.kind.as_str(),
        message.content
    )
}
