//! Command implementations. Everything prints JSON on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use eventsync_core::api::{AgendaAction, LiveUpdates, MutationOutcome};
use eventsync_core::models::{Alert, EventFilter, Route, User};
use eventsync_core::queue::SyncReport;
use eventsync_core::store::Collection;
use eventsync_core::{
    AgendaQuery, ApiClient, Database, EventQueries, FallbackQuery, OfflineClient, PendingQueue,
    SyncDriver,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Config;
use crate::{AgendaCommand, Cli, Command, QueueCommand};

pub struct Context {
    config: Config,
    api: ApiClient,
    db: Database,
    user: Option<String>,
}

impl Context {
    pub fn new(config: Config, cli: &Cli) -> Result<Self> {
        let base_url = config.resolve_api_base_url(cli.api_url.as_deref());
        let mut api = ApiClient::new(&base_url).context("Failed to build HTTP client")?;
        if let Some(token) = cli.token.clone().or_else(|| config.access_token.clone()) {
            api.set_token(token);
        }

        let db_path = config.database_path()?;
        debug!(api = %base_url, store = %db_path.display(), "Resolved settings");
        let user = cli.user.clone().or_else(|| config.user_id.clone());

        Ok(Self {
            db: Database::shared(db_path),
            config,
            api,
            user,
        })
    }

    fn user(&self) -> Result<&str> {
        match self.user.as_deref() {
            Some(user) => Ok(user),
            None => bail!("No user given; pass --user or run `eventsync config --set-user <id>`"),
        }
    }

    fn queue(&self) -> PendingQueue {
        PendingQueue::new(self.db.clone())
    }

    fn driver(&self) -> SyncDriver {
        SyncDriver::new(self.db.clone(), self.queue(), Arc::new(self.api.clone()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome<T: Serialize>(outcome: &MutationOutcome<T>) -> Result<()> {
    match outcome {
        MutationOutcome::Applied(value) => print_json(&json!({"status": "applied", "result": value})),
        MutationOutcome::Queued(op) => print_json(&json!({"status": "queued", "operation": op})),
    }
}

pub async fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Events {
            category,
            date,
            search,
            upcoming,
        } => {
            let queries = EventQueries::new(ctx.api.clone(), ctx.db.clone());
            let result = match upcoming {
                Some(limit) => queries.upcoming(limit).await?,
                None => queries.list(&EventFilter { category, date, search }).await?,
            };
            print_json(&result)
        }
        Command::Event { id } => {
            let queries = EventQueries::new(ctx.api.clone(), ctx.db.clone());
            let result = queries.detail(&id).await?;
            if result.data.is_none() {
                bail!("Event {} not found", id);
            }
            print_json(&result)
        }
        Command::Alerts { active } => {
            let query = FallbackQuery::<Alert, _>::new(ctx.api.clone(), ctx.db.clone());
            let mut result = query.fetch().await?;
            if active {
                result.data.retain(|alert| alert.is_active);
            }
            print_json(&result)
        }
        Command::Routes => {
            let query = FallbackQuery::<Route, _>::new(ctx.api.clone(), ctx.db.clone());
            print_json(&query.fetch().await?)
        }
        Command::Users { role } => {
            let query = FallbackQuery::<User, _>::new(ctx.api.clone(), ctx.db.clone());
            let mut result = query.fetch().await?;
            if let Some(role) = role {
                result.data.retain(|user| user.role == role);
            }
            print_json(&result)
        }
        Command::Agenda { action } => agenda(ctx, action).await,
        Command::Queue { action } => queue(ctx, action).await,
        Command::Watch => watch(ctx).await,
        Command::Status => status(ctx).await,
        Command::Config {
            set_api_url,
            set_user,
            set_data_dir,
        } => {
            let mut config = ctx.config.clone();
            let changed = set_api_url.is_some() || set_user.is_some() || set_data_dir.is_some();
            if let Some(url) = set_api_url {
                config.api_base_url = Some(url);
            }
            if let Some(user) = set_user {
                config.user_id = Some(user);
            }
            if let Some(dir) = set_data_dir {
                config.data_dir = Some(dir);
            }
            if changed {
                config.save().context("Failed to save config")?;
                info!("Config saved");
            }
            print_json(&config.redacted())
        }
    }
}

async fn agenda(ctx: &Context, action: Option<AgendaCommand>) -> Result<()> {
    let user = ctx.user()?;
    let (action, event_id) = match action {
        None => {
            let query = AgendaQuery::new(ctx.api.clone(), ctx.db.clone());
            return print_json(&query.fetch(user).await?);
        }
        Some(AgendaCommand::Attend { event_id }) => (AgendaAction::Attend, event_id),
        Some(AgendaCommand::Interest { event_id }) => (AgendaAction::Interest, event_id),
        Some(AgendaCommand::NotGoing { event_id }) => (AgendaAction::NotGoing, event_id),
        Some(AgendaCommand::Remove { event_id }) => (AgendaAction::Remove, event_id),
    };

    let client = OfflineClient::new(ctx.api.clone(), ctx.queue(), ctx.db.clone());
    let outcome = client.agenda(user, &event_id, action).await?;
    print_outcome(&outcome)
}

async fn queue(ctx: &Context, action: QueueCommand) -> Result<()> {
    let queue = ctx.queue();
    match action {
        QueueCommand::List => print_json(&queue.list_ordered().await?),
        QueueCommand::Sync { every: None } => print_json(&ctx.driver().sync_pending().await?),
        QueueCommand::Sync { every: Some(secs) } => {
            let driver = ctx.driver();
            let mut status = driver.subscribe();
            let worker = driver.spawn(Duration::from_secs(secs));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow_and_update();
                        print_json(&current)?;
                    }
                }
            }
            worker.shutdown().await;
            Ok(())
        }
        QueueCommand::Retry { id } => {
            if queue.get(&id).await?.is_none() {
                bail!("No queued operation {}", id);
            }
            let report: SyncReport = ctx.driver().retry(&id).await?;
            print_json(&report)
        }
        QueueCommand::ClearFailed => print_json(&json!({"removed": queue.clear_failed().await?})),
        QueueCommand::Clear => print_json(&json!({"removed": queue.clear().await?})),
    }
}

async fn watch(ctx: &Context) -> Result<()> {
    let live = LiveUpdates::new(&ctx.api).context("Failed to build stream client")?;
    let mut subscription = live.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = subscription.recv() => match message {
                Some(message) => println!("{}", serde_json::to_string(&message)?),
                None => break,
            },
        }
    }
    subscription.close().await;
    Ok(())
}

async fn status(ctx: &Context) -> Result<()> {
    let store = ctx.db.open().await.context("Failed to open local store")?;
    let mut collections = serde_json::Map::new();
    for collection in Collection::ALL {
        collections.insert(collection.name().to_string(), json!(store.count(collection).await?));
    }

    print_json(&json!({
        "api_base_url": ctx.api.base_url(),
        "store": ctx.config.database_path()?,
        "schema_version": store.version(),
        "user": ctx.user,
        "collections": collections,
        "queue": ctx.queue().counts().await?,
    }))
}
