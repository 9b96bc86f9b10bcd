use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheEngine, SqliteStorage};
use crate::clients::{ClientMessage, LocalClients};
use crate::config::Config;
use crate::connectivity::{Connectivity, GatedNetwork};
use crate::db::Database;
use crate::event::{EventHandler, WorkerEvent};
use crate::http::{HttpNetwork, Network};
use crate::notify::{ConsoleNotifier, LocalPushManager, NotificationChannel, Notifier};
use crate::queue::{MutationQueue, SqliteMutationLog};
use crate::sync::{HttpSink, MutationSink, SyncCoordinator, SyncRegistry, SyncReport, SyncTrigger};
use crate::tasks::{TaskService, TaskStore};
use crate::worker::{Worker, WorkerContext};

/// Application state
pub struct App {
  config: Config,
  connectivity: Connectivity,
  /// Ungated network, used for connectivity probes
  network: Arc<dyn Network>,
  clients: Arc<LocalClients>,
  tasks: TaskService,
  worker: Arc<Worker>,
  /// Connectivity was pinned offline from the command line
  forced_offline: bool,
}

impl App {
  pub fn new(config: Config, offline: bool) -> Result<Self> {
    let db = Arc::new(Database::open(config.database.path.as_deref())?);
    let network = Arc::new(HttpNetwork::new(
      Config::get_api_token(),
      config.server_base(),
    )?);
    let mut app = Self::with_parts(config, db, network, Arc::new(ConsoleNotifier), !offline)?;
    app.forced_offline = offline;
    Ok(app)
  }

  /// Wire every component over the given store, network and notifier.
  pub fn with_parts(
    config: Config,
    db: Arc<Database>,
    network: Arc<dyn Network>,
    notifier: Arc<dyn Notifier>,
    online: bool,
  ) -> Result<Self> {
    let connectivity = Connectivity::new(online);
    let gated: Arc<dyn Network> = Arc::new(GatedNetwork::new(
      Arc::clone(&network),
      connectivity.clone(),
    ));
    let clients = Arc::new(LocalClients::new());

    let engine = Arc::new(CacheEngine::new(
      &config,
      Arc::new(SqliteStorage::new(Arc::clone(&db))),
      Arc::clone(&gated),
    ));
    let queue = MutationQueue::new(Arc::new(SqliteMutationLog::new(Arc::clone(&db))));
    let store = TaskStore::new(Arc::clone(&db));
    let registry = SyncRegistry::new(Arc::clone(&db));
    let sink: Arc<dyn MutationSink> = Arc::new(HttpSink::new(gated, &config)?);

    let manager = Arc::new(LocalPushManager::new(
      Arc::clone(&db),
      config.notifications.permission,
      config.notifications.push_endpoint.clone(),
    ));
    let notifications = Arc::new(NotificationChannel::new(
      &config,
      db,
      manager,
      notifier,
      clients.clone(),
    ));

    let sync = Arc::new(SyncCoordinator::new(
      &config.sync,
      queue.clone(),
      store.clone(),
      Arc::clone(&sink),
      clients.clone(),
      Arc::clone(&notifications),
    ));

    let tasks = TaskService::new(
      store,
      queue.clone(),
      sink,
      connectivity.clone(),
      registry.clone(),
      config.sync.tag.clone(),
    );

    let worker = Arc::new(Worker::new(WorkerContext {
      config: config.clone(),
      engine,
      sync,
      notifications,
      clients: clients.clone(),
      registry,
      queue,
    }));

    Ok(Self {
      config,
      connectivity,
      network,
      clients,
      tasks,
      worker,
      forced_offline: false,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn tasks(&self) -> &TaskService {
    &self.tasks
  }

  pub fn worker(&self) -> &Arc<Worker> {
    &self.worker
  }

  pub fn clients(&self) -> &Arc<LocalClients> {
    &self.clients
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Drain the queue now, clearing sync registrations once it is empty.
  pub async fn sync_now(&self) -> Result<SyncReport> {
    let ctx = self.worker.context();
    let report = ctx.sync.run(SyncTrigger::Manual).await;
    if !report.aborted && ctx.queue.is_empty()? {
      for tag in ctx.registry.registered()? {
        ctx.registry.unregister(&tag)?;
      }
    }
    Ok(report)
  }

  /// Long-lived worker loop: probes connectivity, fires sync on reconnect
  /// and prints client messages until interrupted.
  pub async fn run(&self) -> Result<()> {
    let ctx = self.worker.context();
    let mut events = EventHandler::new();
    events.watch_connectivity(&self.connectivity, ctx.registry.clone());

    let probe = if self.forced_offline {
      None
    } else {
      Some(self.connectivity.spawn_probe(
        Arc::clone(&self.network),
        self.config.server_base().clone(),
        self.config.sync.probe_interval(),
      ))
    };

    let window = self.clients.attach(self.config.origin.clone())?;
    debug!(client = %window.id, "attached console client");
    let mut messages = self.clients.subscribe();

    let tx = events.sender();
    let _ = tx.send(WorkerEvent::Activate);
    if self.connectivity.is_online() {
      for tag in ctx.registry.registered()? {
        let _ = tx.send(WorkerEvent::Sync { tag });
      }
    }

    info!(online = self.connectivity.is_online(), "worker running");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        Some(event) = events.next() => {
          self.worker.spawn(event);
        }
        Ok((client, message)) = messages.recv() => {
          print_message(&client, &message);
        }
      }
    }

    if let Some(probe) = probe {
      probe.abort();
    }
    ctx.engine.settle().await;
    info!("worker stopped");
    Ok(())
  }
}

fn print_message(client: &str, message: &ClientMessage) {
  match serde_json::to_string(message) {
    Ok(json) => println!("[{}] {}", client, json),
    Err(e) => tracing::warn!(error = %e, "failed to render client message"),
  }
}
