//! Event dispatch for the offline worker.
//!
//! Each event kind maps to one handler in an explicit table. Handlers run as
//! spawned tasks, so a revalidation, a drain and a fetch can be in flight at
//! the same time.

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheEngine;
use crate::clients::Clients;
use crate::config::Config;
use crate::event::{EventKind, WorkerEvent};
use crate::http::{Request, Response};
use crate::notify::NotificationChannel;
use crate::queue::MutationQueue;
use crate::sync::{SyncCoordinator, SyncRegistry, SyncTrigger};

/// Everything a handler may touch.
pub struct WorkerContext {
  pub config: Config,
  pub engine: Arc<CacheEngine>,
  pub sync: Arc<SyncCoordinator>,
  pub notifications: Arc<NotificationChannel>,
  pub clients: Arc<dyn Clients>,
  pub registry: SyncRegistry,
  pub queue: MutationQueue,
}

type Handler = Box<dyn Fn(Arc<WorkerContext>, WorkerEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn handler<F, Fut>(f: F) -> Handler
where
  F: Fn(Arc<WorkerContext>, WorkerEvent) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<()>> + Send + 'static,
{
  Box::new(move |ctx: Arc<WorkerContext>, event: WorkerEvent| f(ctx, event).boxed())
}

pub struct Worker {
  ctx: Arc<WorkerContext>,
  handlers: HashMap<EventKind, Handler>,
}

impl Worker {
  pub fn new(ctx: WorkerContext) -> Self {
    let mut handlers: HashMap<EventKind, Handler> = HashMap::new();
    handlers.insert(EventKind::Install, handler(on_install));
    handlers.insert(EventKind::Activate, handler(on_activate));
    handlers.insert(EventKind::Fetch, handler(on_fetch));
    handlers.insert(EventKind::Sync, handler(on_sync));
    handlers.insert(EventKind::Reconnected, handler(on_reconnected));
    handlers.insert(EventKind::Push, handler(on_push));
    handlers.insert(EventKind::NotificationClick, handler(on_notification_click));

    Self {
      ctx: Arc::new(ctx),
      handlers,
    }
  }

  pub fn context(&self) -> &Arc<WorkerContext> {
    &self.ctx
  }

  /// Run the handler registered for the event's kind.
  pub async fn dispatch(&self, event: WorkerEvent) -> Result<()> {
    let kind = event.kind();
    match self.handlers.get(&kind) {
      Some(handler) => handler(Arc::clone(&self.ctx), event).await,
      None => {
        debug!(?kind, "no handler registered");
        Ok(())
      }
    }
  }

  /// Dispatch on a spawned task. Handler errors are logged.
  pub fn spawn(self: &Arc<Self>, event: WorkerEvent) -> JoinHandle<()> {
    let worker = Arc::clone(self);
    tokio::spawn(async move {
      let kind = event.kind();
      if let Err(e) = worker.dispatch(event).await {
        warn!(?kind, error = %e, "event handler failed");
      }
    })
  }

  /// Answer a request through the fetch handler.
  pub async fn fetch(&self, request: Request) -> Response {
    let (tx, rx) = oneshot::channel();
    let event = WorkerEvent::Fetch {
      request,
      respond_to: Some(tx),
    };
    if let Err(e) = self.dispatch(event).await {
      warn!(error = %e, "fetch handler failed");
    }
    rx.await
      .unwrap_or_else(|_| crate::cache::fallback::not_available_offline())
  }
}

async fn on_install(ctx: Arc<WorkerContext>, _event: WorkerEvent) -> Result<()> {
  let manifest = ctx.config.precache_manifest()?;
  let count = ctx.engine.install(&manifest).await?;
  info!(count, "install complete, activating");
  // Skip waiting: a fresh install takes over right away.
  on_activate(ctx, WorkerEvent::Activate).await
}

async fn on_activate(ctx: Arc<WorkerContext>, _event: WorkerEvent) -> Result<()> {
  let deleted = ctx.engine.activate()?;
  let claimed = ctx.clients.claim().await?;
  info!(
    cache = ctx.engine.cache_name(),
    purged = deleted.len(),
    claimed,
    "activated"
  );
  Ok(())
}

async fn on_fetch(ctx: Arc<WorkerContext>, event: WorkerEvent) -> Result<()> {
  if let WorkerEvent::Fetch {
    request,
    respond_to,
  } = event
  {
    let response = ctx.engine.handle(&request).await;
    if let Some(tx) = respond_to {
      if tx.send(response).is_err() {
        debug!(url = %request.url, "fetch requester went away");
      }
    }
  }
  Ok(())
}

async fn on_sync(ctx: Arc<WorkerContext>, event: WorkerEvent) -> Result<()> {
  let WorkerEvent::Sync { tag } = event else {
    return Ok(());
  };
  let Some(report) = ctx.sync.handle_sync_event(&tag).await else {
    return Ok(());
  };

  // Keep the tag while anything is left, so the next reconnect retries.
  if !report.aborted && !report.coalesced && ctx.queue.is_empty()? {
    ctx.registry.unregister(&tag)?;
    debug!(tag, "sync registration cleared");
  }
  Ok(())
}

async fn on_reconnected(ctx: Arc<WorkerContext>, _event: WorkerEvent) -> Result<()> {
  ctx.sync.run(SyncTrigger::Reconnected).await;
  Ok(())
}

async fn on_push(ctx: Arc<WorkerContext>, event: WorkerEvent) -> Result<()> {
  if let WorkerEvent::Push { payload } = event {
    let shown = ctx.notifications.handle_push(payload.as_deref()).await;
    debug!(title = %shown.title, "push handled");
  }
  Ok(())
}

async fn on_notification_click(ctx: Arc<WorkerContext>, event: WorkerEvent) -> Result<()> {
  if let WorkerEvent::NotificationClick { notification } = event {
    let action = ctx.notifications.handle_click(&notification).await?;
    debug!(?action, "notification click handled");
  }
  Ok(())
}
