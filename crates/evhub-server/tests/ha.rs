use std::sync::Arc;
use std::time::Duration;

use evhub_client::NotificationClient;
use evhub_core::{EventDraft, ListenCursor, Version};
use evhub_server::{HaConfig, NotificationServer, ServerHandle};
use evhub_store::{EventStore, MemoryStore};
use evhub_util_err::BoxedErrorResult;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);
const HEARTBEAT: Duration = Duration::from_millis(100);

async fn start_ha_server(store: Arc<dyn EventStore>) -> BoxedErrorResult<(ServerHandle, String)> {
    let server = NotificationServer::builder()
        .store(store)
        .bind_addr("127.0.0.1:0")
        .ha(HaConfig::new(HEARTBEAT))
        .bind()
        .await?;
    let handle = server.handle();
    let uri = server.local_addr().to_string();
    tokio::spawn(server.run());
    Ok((handle, uri))
}

fn draft(key: &str, value: &str) -> EventDraft {
    EventDraft::builder()
        .key(key)
        .value(value.as_bytes().to_vec())
        .build()
}

async fn wait_for_leader(client: &NotificationClient) -> BoxedErrorResult<String> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let members = client.list_members().await?;
        if let Some(leader) = members.iter().find(|m| m.is_leader && m.is_alive) {
            return Ok(leader.server_uri.clone());
        }
        if deadline < tokio::time::Instant::now() {
            return Err("No leader elected in time".into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_followers_redirect_writes_to_the_leader() -> BoxedErrorResult<()> {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let (_h1, uri1) = start_ha_server(store.clone()).await?;
    let (_h2, uri2) = start_ha_server(store.clone()).await?;
    let (_h3, uri3) = start_ha_server(store.clone()).await?;

    // point the client at an arbitrary peer; redirects do the rest
    let client = NotificationClient::builder()
        .server_uri(uri2.clone())
        .enable_ha(true)
        .list_member_interval_ms(200)
        .retry_timeout_ms(10_000)
        .connect()
        .await?;

    let leader_uri = wait_for_leader(&client).await?;
    assert!([&uri1, &uri2, &uri3].contains(&&leader_uri));

    let event = client.send_event(draft("key", "value1")).await?;
    assert_eq!(event.version, Version::from(1));

    // reads are fine on any peer, they share the store
    let members = client.list_members().await?;
    assert_eq!(members.iter().filter(|m| m.is_alive).count(), 3);
    assert_eq!(members.iter().filter(|m| m.is_leader).count(), 1);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_client_and_listener_survive_failover() -> BoxedErrorResult<()> {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let (h1, uri1) = start_ha_server(store.clone()).await?;
    let (h2, uri2) = start_ha_server(store.clone()).await?;
    let (h3, uri3) = start_ha_server(store.clone()).await?;

    let client = NotificationClient::builder()
        .server_uri(uri1.clone())
        .enable_ha(true)
        .list_member_interval_ms(200)
        .retry_timeout_ms(10_000)
        .connect()
        .await?;

    let leader_uri = wait_for_leader(&client).await?;

    let event1 = client.send_event(draft("key", "value1")).await?;
    assert_eq!(event1.version, Version::from(1));

    // listener talks to whichever peer the client picked; its cursor is
    // what preserves continuity across the failover below
    let mut handle = client
        .start_listen_all_events(ListenCursor::BEGINNING)
        .await?;
    let seen1 = timeout(WAIT, handle.next_event()).await?.unwrap();
    assert_eq!(seen1.version, event1.version);

    // kill the current leader
    for (h, uri) in [(&h1, &uri1), (&h2, &uri2), (&h3, &uri3)] {
        if *uri == leader_uri {
            h.stop();
        }
    }

    // a successor takes over and the same client keeps writing
    let event2 = client.send_event(draft("key", "value2")).await?;
    assert_eq!(event2.version, Version::from(2));

    let new_leader = wait_for_leader(&client).await?;
    assert_ne!(new_leader, leader_uri);

    // the listener either kept its stream (it was on a survivor) or
    // re-registered from its cursor; either way version 2 arrives
    let seen2 = timeout(WAIT, handle.next_event()).await?.unwrap();
    assert_eq!(seen2.version, event2.version);

    handle.stop().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_ha_client_against_single_server() -> BoxedErrorResult<()> {
    // an HA-enabled client pointed at a standalone server just keeps using
    // its configured uri; the member list stays empty
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let server = NotificationServer::builder()
        .store(store)
        .bind_addr("127.0.0.1:0")
        .bind()
        .await?;
    let uri = server.local_addr().to_string();
    tokio::spawn(server.run());

    let client = NotificationClient::builder()
        .server_uri(uri)
        .enable_ha(true)
        .list_member_interval_ms(200)
        .retry_timeout_ms(2_000)
        .connect()
        .await?;

    assert!(client.list_members().await?.is_empty());
    let event = client.send_event(draft("key", "value1")).await?;
    assert_eq!(event.version, Version::from(1));

    Ok(())
}
