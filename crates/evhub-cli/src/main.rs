mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cli::{ConnOpts, Opts};
use evhub_client::{ClientError, NotificationClient};
use evhub_core::filter::KeyFilter;
use evhub_core::{ListenCursor, Timestamp, Version};
use evhub_server::{HaConfig, NotificationServer, ServerError};
use evhub_store::{Database, EventStore, MemoryStore, StoreError};
use snafu::{ResultExt, Snafu, Whatever};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "evhub::cli";

type WhateverResult<T> = std::result::Result<T, snafu::Whatever>;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Storage error: {source}"))]
    Store { source: StoreError },
    #[snafu(display("Server error: {source}"))]
    Server { source: ServerError },
    #[snafu(transparent)]
    Client { source: ClientError },
    #[snafu(display("Miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    handle_cmd(opts).await
}

fn init_logging() -> WhateverResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .whatever_context("Invalid logging filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

async fn connect(conn: &ConnOpts) -> CliResult<NotificationClient> {
    Ok(NotificationClient::builder()
        .server_uri(conn.server.clone())
        .maybe_namespace(conn.default_namespace.clone())
        .maybe_sender(conn.default_sender.clone())
        .enable_ha(conn.ha)
        .connect()
        .await?)
}

fn key_filter(keys: &[String]) -> KeyFilter {
    if keys.is_empty() || keys.iter().any(|key| key == "*") {
        KeyFilter::Any
    } else {
        KeyFilter::keys(keys.iter().cloned())
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("Can't fail")
    );
}

async fn handle_cmd(opts: Opts) -> CliResult<()> {
    match opts.cmd {
        cli::OptsCmd::Serve {
            bind,
            db,
            ha,
            server_uri,
            heartbeat_ms,
            ttl_ms,
        } => {
            let store: Arc<dyn EventStore> = match db {
                Some(path) => Arc::new(Database::open(path).await.context(StoreSnafu)?),
                None => Arc::new(MemoryStore::new()),
            };

            let ha_config = ha.then(|| {
                let mut config = HaConfig::new(Duration::from_millis(heartbeat_ms));
                if let Some(uri) = server_uri {
                    config = config.with_server_uri(uri);
                }
                match ttl_ms {
                    Some(ttl_ms) => config.with_ttl(Duration::from_millis(ttl_ms)),
                    None => config,
                }
            });

            let server = NotificationServer::builder()
                .store(store)
                .bind_addr(bind)
                .maybe_ha(ha_config)
                .bind()
                .await
                .context(ServerSnafu)?;
            let handle = server.handle();
            info!(target: LOG_TARGET, addr = %server.local_addr(), "Notification server up");

            tokio::select! {
                _ = server.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!(target: LOG_TARGET, "Interrupted, shutting down");
                    handle.stop();
                }
            }
            Ok(())
        }
        cli::OptsCmd::Send {
            conn,
            key,
            value,
            event_type,
            namespace,
            sender,
            context,
        } => {
            let client = connect(&conn).await?;
            let event = client
                .send_event(
                    evhub_core::EventDraft::builder()
                        .key(key)
                        .value(value.into_bytes())
                        .maybe_event_type(event_type)
                        .maybe_namespace(namespace)
                        .maybe_sender(sender)
                        .maybe_context(context)
                        .build(),
                )
                .await?;
            print_json(&event);
            Ok(())
        }
        cli::OptsCmd::List {
            conn,
            key,
            version,
            event_type,
            namespace,
            sender,
        } => {
            let client = connect(&conn).await?;
            let events = client
                .list_events(
                    key_filter(&key),
                    Version::from(version),
                    event_type.as_deref(),
                    namespace.as_deref(),
                    sender.as_deref(),
                )
                .await?;
            print_json(&events);
            Ok(())
        }
        cli::OptsCmd::Listen {
            conn,
            key,
            version,
            start_time,
            event_type,
            namespace,
            sender,
        } => {
            let client = connect(&conn).await?;
            let cursor = match (version, start_time) {
                (Some(version), _) => ListenCursor::Version(Version::from(version)),
                (None, Some(start_time)) => ListenCursor::Time(Timestamp::from(start_time)),
                (None, None) => ListenCursor::Time(Timestamp::now()),
            };
            let mut handle = client
                .start_listen_events(
                    key_filter(&key),
                    cursor,
                    event_type.as_deref(),
                    namespace.as_deref(),
                    sender.as_deref(),
                )
                .await?;

            loop {
                tokio::select! {
                    event = handle.next_event() => match event {
                        Some(event) => print_json(&event),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        handle.stop().await;
                        break;
                    }
                }
            }
            Ok(())
        }
        cli::OptsCmd::Members { conn } => {
            let client = connect(&conn).await?;
            let members = client.list_members().await?;
            print_json(&members);
            Ok(())
        }
    }
}
