mod app;
mod cache;
mod clients;
mod config;
mod connectivity;
mod db;
mod event;
mod http;
mod notify;
mod queue;
mod sync;
mod tasks;
#[cfg(test)]
mod test_utils;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::http::{Destination, Request};
use crate::tasks::{Dispatch, TaskId, TaskRecord};

#[derive(Parser, Debug)]
#[command(name = "taskflow")]
#[command(about = "Offline-first task list with a caching worker and background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/taskflow/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the network as unreachable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Add a task
  Add { text: String },
  /// List tasks
  List,
  /// Flip a task between open and completed
  Toggle { id: i64 },
  /// Delete a task
  Delete { id: i64 },
  /// Delete every completed task
  ClearCompleted,
  /// Show mutations waiting for the server
  Queue,
  /// Drop every queued mutation
  ClearQueue,
  /// Deliver queued mutations now
  Sync,
  /// Precache the app shell, then activate
  Install,
  /// Purge stale cache generations
  Activate,
  /// List cache generations and their entries
  Caches,
  /// Fetch a URL through the cache engine
  Fetch {
    url: String,
    /// Request destination (document, script, style, image, font)
    #[arg(short, long, default_value = "empty")]
    destination: String,
  },
  /// Push subscription management
  Push {
    #[command(subcommand)]
    action: PushAction,
  },
  /// Run the worker until interrupted
  Run,
}

#[derive(Subcommand, Debug)]
enum PushAction {
  Subscribe,
  Unsubscribe,
  Status,
  /// Show a local test notification
  Test,
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = db::Database::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "taskflow.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("TASKFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn print_task(task: &TaskRecord) {
  println!(
    "{:>4}  [{}] {}{}",
    task.id.to_string(),
    if task.completed { "x" } else { " " },
    task.text,
    if task.synced { "" } else { "  (pending sync)" }
  );
}

fn describe(dispatch: Dispatch) -> String {
  match dispatch {
    Dispatch::Delivered => "sent".to_string(),
    Dispatch::Queued(id) => format!("queued as mutation {}", id),
    Dispatch::Folded => "merged into queued change".to_string(),
    Dispatch::Discarded => "dropped before it reached the server".to_string(),
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config, args.offline)?;

  match args.command {
    Command::Add { text } => {
      let (task, dispatch) = app.tasks().add_task(&text).await?;
      print_task(&task);
      println!("{}", describe(dispatch));
    }
    Command::List => {
      for task in app.tasks().list()? {
        print_task(&task);
      }
    }
    Command::Toggle { id } => match app.tasks().toggle_task(TaskId(id)).await? {
      Some((task, dispatch)) => {
        print_task(&task);
        println!("{}", describe(dispatch));
      }
      None => return Err(eyre!("No task with id {}", id)),
    },
    Command::Delete { id } => match app.tasks().delete_task(TaskId(id)).await? {
      Some(dispatch) => println!("deleted {}, {}", id, describe(dispatch)),
      None => return Err(eyre!("No task with id {}", id)),
    },
    Command::ClearCompleted => {
      let cleared = app.tasks().clear_completed().await?;
      println!("cleared {} completed task(s)", cleared.len());
    }
    Command::Queue => {
      for mutation in app.tasks().pending()? {
        let task = mutation
          .local_ref
          .map(|r| r.to_string())
          .unwrap_or_else(|| "-".to_string());
        println!(
          "{:>4}  {:<6} task {:<4} {}",
          mutation.id.to_string(),
          mutation.kind.to_string(),
          task,
          mutation.enqueued_at.to_rfc3339()
        );
      }
    }
    Command::ClearQueue => {
      let cleared = app.worker().context().queue.clear()?;
      println!("dropped {} queued mutation(s)", cleared);
    }
    Command::Sync => {
      let report = app.sync_now().await?;
      if report.aborted {
        return Err(eyre!("Mutation log unavailable, nothing was synced"));
      }
      println!("synced {}, failed {}", report.acked(), report.failed());
    }
    Command::Install => {
      app
        .worker()
        .dispatch(event::WorkerEvent::Install)
        .await?;
      println!("installed {}", app.worker().context().engine.cache_name());
    }
    Command::Activate => {
      app
        .worker()
        .dispatch(event::WorkerEvent::Activate)
        .await?;
      println!("active cache {}", app.worker().context().engine.cache_name());
    }
    Command::Caches => {
      let storage = app.worker().context().engine.storage();
      for name in storage.cache_names()? {
        println!("{}", name);
        for key in storage.keys(&name)? {
          println!("  {}", key);
        }
      }
    }
    Command::Fetch { url, destination } => {
      let destination: Destination = destination.parse().map_err(|e: String| eyre!(e))?;
      let url = app.config().resolve(&url)?;
      let request = Request::get(url).with_destination(destination);
      let response = app.worker().fetch(request).await;
      app.worker().context().engine.settle().await;
      println!(
        "{} {} ({:?})",
        response.status, response.status_text, response.source
      );
      println!("{}", response.text());
    }
    Command::Push { action } => {
      let notifications = &app.worker().context().notifications;
      match action {
        PushAction::Subscribe => match notifications.subscribe().await? {
          Some(subscription) => println!("subscribed: {}", subscription.endpoint),
          None => println!("not subscribed: push unavailable or permission not granted"),
        },
        PushAction::Unsubscribe => {
          if notifications.unsubscribe().await? {
            println!("unsubscribed");
          } else {
            println!("no subscription");
          }
        }
        PushAction::Status => {
          let status = notifications.status().await?;
          println!(
            "supported: {}, permission: {}, subscribed: {}",
            status.supported, status.permission, status.subscribed
          );
        }
        PushAction::Test => {
          if !notifications.test_notification().await? {
            println!("no subscription, run `taskflow push subscribe` first");
          }
        }
      }
    }
    Command::Run => app.run().await?,
  }

  Ok(())
}
