use std::sync::Arc;
use std::time::Duration;

use evhub_client::NotificationClient;
use evhub_core::filter::KeyFilter;
use evhub_core::{EventDraft, ListenCursor, Timestamp, Version};
use evhub_server::{NotificationServer, ServerHandle};
use evhub_store::{EventStore, MemoryStore};
use evhub_util_err::BoxedErrorResult;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
/// A window long enough to be confident nothing more is coming.
const QUIET: Duration = Duration::from_millis(300);

async fn start_server(store: Arc<dyn EventStore>) -> BoxedErrorResult<(ServerHandle, String)> {
    let server = NotificationServer::builder()
        .store(store)
        .bind_addr("127.0.0.1:0")
        .bind()
        .await?;
    let handle = server.handle();
    let uri = server.local_addr().to_string();
    tokio::spawn(server.run());
    Ok((handle, uri))
}

async fn start_memory_server() -> BoxedErrorResult<(ServerHandle, String)> {
    start_server(Arc::new(MemoryStore::new())).await
}

fn draft(key: &str, value: &str) -> EventDraft {
    EventDraft::builder()
        .key(key)
        .value(value.as_bytes().to_vec())
        .build()
}

fn typed_draft(key: &str, value: &str, event_type: &str) -> EventDraft {
    EventDraft::builder()
        .key(key)
        .value(value.as_bytes().to_vec())
        .event_type(event_type)
        .build()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_namespaced_listing() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder()
        .server_uri(uri)
        .namespace("a")
        .sender("s")
        .enable_idempotence(true)
        .connect()
        .await?;

    let event1 = client.send_event(draft("key", "value1")).await?;
    assert_eq!(event1.version, Version::from(1));

    client.set_default_namespace(Some("b".to_owned()));
    client.send_event(typed_draft("key", "value2", "a")).await?;
    client.send_event(draft("key", "value3")).await?;
    client.send_event(draft("key2", "value3")).await?;

    // everything above event1 on either key, in the current namespace "b"
    let events = client
        .list_events(
            KeyFilter::keys(["key", "key2"]),
            event1.version,
            None,
            None,
            None,
        )
        .await?;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].sender.as_deref(), Some("s"));

    client.set_default_namespace(Some("a".to_owned()));
    let events = client
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events.len(), 1);
    let counts = client
        .count_events(KeyFilter::single("key"), None, None, None)
        .await?;
    assert_eq!(counts.total, 1);

    client.set_default_namespace(Some("b".to_owned()));
    let events = client
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events.len(), 2);

    let events = client
        .list_events(
            KeyFilter::single("key"),
            Version::ZERO,
            Some("a"),
            None,
            None,
        )
        .await?;
    assert_eq!(events.len(), 1);

    let events = client
        .list_events(
            KeyFilter::single("key"),
            Version::ZERO,
            None,
            None,
            Some("s"),
        )
        .await?;
    assert_eq!(events.len(), 2);
    let counts = client
        .count_events(KeyFilter::single("key"), None, None, Some("s"))
        .await?;
    assert_eq!(counts.total, 2);
    assert_eq!(counts.by_sender[0].count, 2);

    let events = client
        .list_events(
            KeyFilter::single("key"),
            Version::ZERO,
            None,
            None,
            Some("p"),
        )
        .await?;
    assert!(events.is_empty());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_listen_filters_by_event_type() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder()
        .server_uri(uri)
        .namespace("a")
        .connect()
        .await?;

    // an event from before the listen window
    client.send_event(draft("key", "value1")).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut handle = client
        .start_listen_events(
            KeyFilter::single("key"),
            ListenCursor::Time(Timestamp::now()),
            Some("e"),
            None,
            None,
        )
        .await?;

    client.send_event(typed_draft("key", "value2", "e")).await?;
    client.send_event(typed_draft("key", "value2", "f")).await?;

    let event = timeout(WAIT, handle.next_event()).await?.unwrap();
    assert_eq!(event.event_type.as_deref(), Some("e"));
    assert!(timeout(QUIET, handle.next_event()).await.is_err());

    handle.stop().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_listen_namespace_wildcard() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder()
        .server_uri(uri)
        .namespace("a")
        .connect()
        .await?;

    let mut handle = client
        .start_listen_events(
            KeyFilter::single("key"),
            ListenCursor::Time(Timestamp::now()),
            None,
            Some("*"),
            None,
        )
        .await?;

    client.send_event(draft("key", "value2")).await?;
    client.set_default_namespace(Some("b".to_owned()));
    client.send_event(draft("key", "value2")).await?;

    let first = timeout(WAIT, handle.next_event()).await?.unwrap();
    let second = timeout(WAIT, handle.next_event()).await?.unwrap();
    assert_eq!(first.namespace.as_deref(), Some("a"));
    assert_eq!(second.namespace.as_deref(), Some("b"));
    assert!(timeout(QUIET, handle.next_event()).await.is_err());

    handle.stop().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_listen_all_events_from_version() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder().server_uri(uri).connect().await?;

    let event1 = client.send_event(draft("key1", "value1")).await?;
    let mut handle = client
        .start_listen_all_events(ListenCursor::Version(event1.version))
        .await?;

    client.send_event(draft("key2", "value2")).await?;
    client.send_event(draft("key3", "value3")).await?;

    let second = timeout(WAIT, handle.next_event()).await?.unwrap();
    let third = timeout(WAIT, handle.next_event()).await?.unwrap();
    assert_eq!(second.key, "key2");
    assert_eq!(third.key, "key3");
    assert!(second.version < third.version);
    assert!(timeout(QUIET, handle.next_event()).await.is_err());

    handle.stop().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_idempotent_producer() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder()
        .server_uri(uri)
        .enable_idempotence(true)
        .connect()
        .await?;

    let event = draft("key", "value1");
    client.send_event(event.clone()).await?;
    let seq = client.sequence_num_manager().unwrap();
    assert_eq!(seq.get_sequence_number(), 1);

    client.send_event(event.clone()).await?;
    assert_eq!(seq.get_sequence_number(), 2);
    let events = client
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events.len(), 2);

    // rolling the counter back makes the next send a duplicate; the store
    // does not change and the counter snaps back to the high-water mark
    seq.set_sequence_number(1);
    let replayed = client.send_event(event).await?;
    assert_eq!(seq.get_sequence_number(), 2);
    let events = client
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events.len(), 2);
    assert_eq!(replayed.version, events[1].version);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_client_recovery_with_reused_id() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client1 = NotificationClient::builder()
        .server_uri(uri.clone())
        .enable_idempotence(true)
        .connect()
        .await?;

    let event = draft("key", "value1");
    client1.send_event(event.clone()).await?;
    client1.send_event(event.clone()).await?;
    assert_eq!(
        client1.sequence_num_manager().unwrap().get_sequence_number(),
        2
    );

    // a recovered producer rebinds to the same client id but only knows it
    // got sequence 1 through
    let client2 = NotificationClient::builder()
        .server_uri(uri)
        .enable_idempotence(true)
        .client_id(client1.client_id().unwrap())
        .initial_sequence_number(1)
        .connect()
        .await?;
    assert_eq!(client2.client_id(), client1.client_id());

    // resending sequence 2 is deduplicated
    client2.send_event(event.clone()).await?;
    assert_eq!(
        client2.sequence_num_manager().unwrap().get_sequence_number(),
        2
    );
    let events = client2
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events.len(), 2);

    // the next send is new
    client2.send_event(event).await?;
    assert_eq!(
        client2.sequence_num_manager().unwrap().get_sequence_number(),
        3
    );
    let events = client2
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events.len(), 3);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_listen_large_events() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder()
        .server_uri(uri.clone())
        .connect()
        .await?;
    client.send_event(draft("key", "value")).await?;

    // a receive window far too small for any event frame
    let small_client = NotificationClient::builder()
        .server_uri(uri.clone())
        .max_frame_len(10)
        .connect()
        .await?;
    let mut small_handle = small_client
        .start_listen_all_events(ListenCursor::BEGINNING)
        .await?;

    let big_client = NotificationClient::builder().server_uri(uri).connect().await?;
    let mut big_handle = big_client
        .start_listen_all_events(ListenCursor::BEGINNING)
        .await?;

    let event = timeout(WAIT, big_handle.next_event()).await?.unwrap();
    assert_eq!(event.key, "key");

    // the small listener gets nothing, but its stream stays healthy
    assert!(timeout(QUIET, small_handle.next_event()).await.is_err());

    assert!(small_handle.stop().await.is_empty());
    assert_eq!(big_handle.stop().await.len(), 0);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_register_delete_and_exists() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client1 = NotificationClient::builder()
        .server_uri(uri.clone())
        .enable_idempotence(true)
        .connect()
        .await?;
    let client2 = NotificationClient::builder()
        .server_uri(uri.clone())
        .enable_idempotence(true)
        .connect()
        .await?;

    let id1 = client1.client_id().unwrap();
    let id2 = client2.client_id().unwrap();
    assert_eq!(u64::from(id2), u64::from(id1) + 1);

    assert!(client2.is_client_exists(id1).await?);
    client1.close().await?;
    assert!(!client2.is_client_exists(id1).await?);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_list_all_events_by_time_and_range() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder().server_uri(uri).connect().await?;

    let event1 = client.send_event(draft("key", "value1")).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let event2 = client.send_event(draft("key", "value2")).await?;
    let event3 = client.send_event(draft("key", "value3")).await?;

    let events = client
        .list_all_events_from_time(event2.create_time, None)
        .await?;
    assert_eq!(events.len(), 2);

    let events = client
        .list_all_events_range(event1.version, Some(event3.version))
        .await?;
    assert_eq!(events.len(), 3);

    let events = client
        .list_all_events_range(event2.version, None)
        .await?;
    assert_eq!(events.len(), 2);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_get_latest_version() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder().server_uri(uri).connect().await?;

    client.send_event(draft("key", "value1")).await?;
    let event = client.send_event(draft("key", "value2")).await?;

    assert_eq!(client.get_latest_version("key", None).await?, event.version);
    assert_eq!(
        client.get_latest_version("missing", None).await?,
        Version::ZERO
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_stopped_server_rejects_sends() -> BoxedErrorResult<()> {
    let (handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder().server_uri(uri).connect().await?;

    client.send_event(draft("key", "value1")).await?;
    handle.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(client.send_event(draft("key", "value2")).await.is_err());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_durable_backend_end_to_end() -> BoxedErrorResult<()> {
    let dir = tempfile::tempdir()?;
    let store = evhub_store::Database::open(dir.path().join("events.redb")).await?;
    let (_handle, uri) = start_server(Arc::new(store)).await?;

    let client = NotificationClient::builder()
        .server_uri(uri)
        .namespace("a")
        .enable_idempotence(true)
        .connect()
        .await?;

    let mut handle = client
        .start_listen_all_events(ListenCursor::BEGINNING)
        .await?;

    let sent = client.send_event(draft("key", "value1")).await?;
    let seen = timeout(WAIT, handle.next_event()).await?.unwrap();
    assert_eq!(seen, sent);

    let events = client
        .list_events(KeyFilter::single("key"), Version::ZERO, None, None, None)
        .await?;
    assert_eq!(events, vec![sent]);

    handle.stop().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_empty_key_is_rejected() -> BoxedErrorResult<()> {
    let (_handle, uri) = start_memory_server().await?;
    let client = NotificationClient::builder().server_uri(uri).connect().await?;

    let err = client.send_event(draft("", "value")).await.unwrap_err();
    assert!(err.to_string().contains("key"));

    Ok(())
}
