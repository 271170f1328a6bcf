use std::sync::Arc;
use std::time::Duration;

use evhub_core::filter::{KeyFilter, NamespaceFilter, SenderFilter, TypeFilter};
use evhub_core::{EventDraft, EventFilter, Timestamp, Version};
use evhub_util_err::BoxedErrorResult;

use crate::{Database, EventStore, MemoryStore, StoreError};

async fn all_stores() -> BoxedErrorResult<Vec<(&'static str, Arc<dyn EventStore>)>> {
    Ok(vec![
        ("memory", Arc::new(MemoryStore::new())),
        ("redb", Arc::new(Database::new_in_memory().await?)),
    ])
}

fn draft(key: &str, value: &str) -> EventDraft {
    EventDraft::builder().key(key).value(value.as_bytes().to_vec()).build()
}

fn draft_in(key: &str, value: &str, namespace: Option<&str>, sender: Option<&str>) -> EventDraft {
    EventDraft::builder()
        .key(key)
        .value(value.as_bytes().to_vec())
        .maybe_namespace(namespace.map(ToOwned::to_owned))
        .maybe_sender(sender.map(ToOwned::to_owned))
        .build()
}

fn filter_for(
    keys: KeyFilter,
    namespace: NamespaceFilter,
    event_type: TypeFilter,
    sender: SenderFilter,
) -> EventFilter {
    EventFilter {
        keys,
        namespace,
        event_type,
        sender,
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_append_assigns_dense_versions() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let mut last_time = Timestamp::ZERO;
        for expected in 1..=5u64 {
            let event = store.append(draft("key", "v")).await?;
            assert_eq!(event.version, Version::from(expected), "backend {name}");
            assert!(last_time <= event.create_time, "backend {name}");
            last_time = event.create_time;
        }
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_list_respects_exclusive_lower_bound_and_filters() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let event1 = store
            .append(draft_in("key", "v1", Some("a"), Some("s")))
            .await?;
        store
            .append(
                EventDraft::builder()
                    .key("key")
                    .value(b"v2".to_vec())
                    .event_type("a")
                    .namespace("b")
                    .sender("s")
                    .build(),
            )
            .await?;
        store
            .append(draft_in("key", "v3", Some("b"), Some("s")))
            .await?;
        store
            .append(draft_in("key2", "v3", Some("b"), Some("s")))
            .await?;

        // both keys, any namespace, above event1
        let events = store
            .list(
                &filter_for(
                    KeyFilter::keys(["key", "key2"]),
                    NamespaceFilter::Any,
                    TypeFilter::Any,
                    SenderFilter::Any,
                ),
                event1.version,
                None,
            )
            .await?;
        assert_eq!(events.len(), 3, "backend {name}");
        assert_eq!(events[0].sender.as_deref(), Some("s"), "backend {name}");
        assert!(
            events.windows(2).all(|w| w[0].version < w[1].version),
            "backend {name}"
        );

        // namespace "a" sees only the first event
        let events = store
            .list(
                &filter_for(
                    KeyFilter::single("key"),
                    NamespaceFilter::Matches(Some("a".to_owned())),
                    TypeFilter::Any,
                    SenderFilter::Any,
                ),
                Version::ZERO,
                None,
            )
            .await?;
        assert_eq!(events.len(), 1, "backend {name}");

        // event_type narrows within namespace "b"
        let events = store
            .list(
                &filter_for(
                    KeyFilter::single("key"),
                    NamespaceFilter::Matches(Some("b".to_owned())),
                    TypeFilter::Exact("a".to_owned()),
                    SenderFilter::Any,
                ),
                Version::ZERO,
                None,
            )
            .await?;
        assert_eq!(events.len(), 1, "backend {name}");

        // limit truncates
        let events = store
            .list(&EventFilter::default(), Version::ZERO, Some(2))
            .await?;
        assert_eq!(events.len(), 2, "backend {name}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_wildcard_semantics() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        store
            .append(draft_in("key_1", "v1", Some("a"), Some("s")))
            .await?;
        store
            .append(draft_in("key_2", "v2", Some("a"), Some("s")))
            .await?;
        store
            .append(
                EventDraft::builder()
                    .key("key_1")
                    .value(b"v1".to_vec())
                    .event_type("event_type")
                    .namespace("b")
                    .sender("p")
                    .build(),
            )
            .await?;
        store.append(draft_in("key_3", "v3", None, None)).await?;

        // any key, any type, namespace "a"
        let events = store
            .list(
                &filter_for(
                    KeyFilter::Any,
                    NamespaceFilter::Matches(Some("a".to_owned())),
                    TypeFilter::Any,
                    SenderFilter::Any,
                ),
                Version::ZERO,
                None,
            )
            .await?;
        assert_eq!(events.len(), 2, "backend {name}");

        // namespace wildcard matches the namespace-less event too
        let events = store
            .list(
                &filter_for(
                    KeyFilter::Any,
                    NamespaceFilter::Any,
                    TypeFilter::Any,
                    SenderFilter::Any,
                ),
                Version::ZERO,
                None,
            )
            .await?;
        assert_eq!(events.len(), 4, "backend {name}");

        // namespace None matches only the namespace-less event
        let events = store
            .list(
                &filter_for(
                    KeyFilter::Any,
                    NamespaceFilter::Matches(None),
                    TypeFilter::Any,
                    SenderFilter::Any,
                ),
                Version::ZERO,
                None,
            )
            .await?;
        assert_eq!(events.len(), 1, "backend {name}");
        assert_eq!(events[0].key, "key_3", "backend {name}");

        // sender "*" requires a sender to be present
        let events = store
            .list(
                &filter_for(
                    KeyFilter::Any,
                    NamespaceFilter::Any,
                    TypeFilter::Any,
                    SenderFilter::Present,
                ),
                Version::ZERO,
                None,
            )
            .await?;
        assert_eq!(events.len(), 3, "backend {name}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_list_range_and_time_windows() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let event1 = store.append(draft("key", "v1")).await?;
        store.append(draft("key", "v2")).await?;
        let event3 = store.append(draft("key", "v3")).await?;

        let events = store
            .list_range(event1.version, Some(event3.version))
            .await?;
        assert_eq!(events.len(), 3, "backend {name}");

        let events = store.list_range(event1.version.next(), None).await?;
        assert_eq!(events.len(), 2, "backend {name}");

        // time window from the first event's create_time covers everything
        let events = store.list_by_time(event1.create_time, None).await?;
        assert_eq!(events.len(), 3, "backend {name}");

        // a window that ends before the first event is empty
        if Timestamp::ZERO < event1.create_time {
            let events = store
                .list_by_time(
                    Timestamp::ZERO,
                    Some(Timestamp::from(u64::from(event1.create_time) - 1)),
                )
                .await?;
            assert!(events.is_empty(), "backend {name}");
        }
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_latest_version_follows_namespace_rule() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        assert_eq!(
            store
                .latest_version("key", &NamespaceFilter::Matches(Some("a".to_owned())))
                .await?,
            Version::ZERO,
            "backend {name}"
        );

        store
            .append(draft_in("key", "v1", Some("a"), None))
            .await?;
        let event2 = store
            .append(draft_in("key", "v2", Some("a"), None))
            .await?;
        let event3 = store
            .append(draft_in("key", "v3", Some("b"), None))
            .await?;

        assert_eq!(
            store
                .latest_version("key", &NamespaceFilter::Matches(Some("a".to_owned())))
                .await?,
            event2.version,
            "backend {name}"
        );
        assert_eq!(
            store.latest_version("key", &NamespaceFilter::Any).await?,
            event3.version,
            "backend {name}"
        );
        assert_eq!(
            store
                .latest_version("other", &NamespaceFilter::Any)
                .await?,
            Version::ZERO,
            "backend {name}"
        );
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_count_breaks_down_by_sender() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        store
            .append(draft_in("key", "v1", Some("b"), Some("s")))
            .await?;
        store
            .append(draft_in("key", "v2", Some("b"), Some("s")))
            .await?;
        store
            .append(draft_in("key", "v3", Some("b"), Some("p")))
            .await?;

        let counts = store
            .count(&filter_for(
                KeyFilter::single("key"),
                NamespaceFilter::Matches(Some("b".to_owned())),
                TypeFilter::Any,
                SenderFilter::Exact("s".to_owned()),
            ))
            .await?;
        assert_eq!(counts.total, 2, "backend {name}");
        assert_eq!(counts.by_sender.len(), 1, "backend {name}");
        assert_eq!(counts.by_sender[0].count, 2, "backend {name}");

        let counts = store
            .count(&filter_for(
                KeyFilter::single("key"),
                NamespaceFilter::Matches(Some("b".to_owned())),
                TypeFilter::Any,
                SenderFilter::Exact("x".to_owned()),
            ))
            .await?;
        assert_eq!(counts.total, 0, "backend {name}");
        assert!(counts.by_sender.is_empty(), "backend {name}");

        let counts = store
            .count(&filter_for(
                KeyFilter::single("key"),
                NamespaceFilter::Matches(Some("b".to_owned())),
                TypeFilter::Any,
                SenderFilter::Any,
            ))
            .await?;
        assert_eq!(counts.total, 3, "backend {name}");
        assert_eq!(counts.by_sender.len(), 2, "backend {name}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_client_registry_lifecycle() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let client1 = store.register_client(Some("a".to_owned()), None).await?;
        let client2 = store.register_client(None, Some("s".to_owned())).await?;
        assert_eq!(
            u64::from(client2),
            u64::from(client1) + 1,
            "backend {name}"
        );

        assert!(store.is_client_exists(client1).await?, "backend {name}");
        store.delete_client(client1).await?;
        assert!(!store.is_client_exists(client1).await?, "backend {name}");
        // idempotent
        store.delete_client(client1).await?;
        assert!(!store.is_client_exists(client1).await?, "backend {name}");

        // the deleted client keeps its slot; ids stay monotonic
        let client3 = store.register_client(None, None).await?;
        assert_eq!(
            u64::from(client3),
            u64::from(client2) + 1,
            "backend {name}"
        );
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_idempotent_append_sequence_slots() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let client = store.register_client(None, None).await?;

        let first = store
            .append_idempotent(client, 1, draft("key", "v1"))
            .await?;
        assert!(!first.is_duplicate(), "backend {name}");
        let first = first.into_event();

        let second = store
            .append_idempotent(client, 2, draft("key", "v1"))
            .await?;
        assert!(!second.is_duplicate(), "backend {name}");
        let second = second.into_event();
        assert_eq!(second.version, first.version.next(), "backend {name}");
        assert_eq!(store.last_sequence(client).await?, 2, "backend {name}");

        // replaying an old sequence number returns the slot's event and
        // appends nothing
        let replayed = store
            .append_idempotent(client, 1, draft("key", "other"))
            .await?;
        assert!(replayed.is_duplicate(), "backend {name}");
        assert_eq!(replayed.into_event(), first, "backend {name}");
        assert_eq!(store.last_sequence(client).await?, 2, "backend {name}");
        assert_eq!(
            store
                .list(&EventFilter::default(), Version::ZERO, None)
                .await?
                .len(),
            2,
            "backend {name}"
        );

        // unknown client is a validation-level error
        let err = store
            .append_idempotent(evhub_core::ClientId::from(9999u64), 1, draft("key", "v"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::UnknownClient { .. }),
            "backend {name}"
        );
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_clean_up_restarts_versions_and_keeps_members() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        store.append(draft("key", "v1")).await?;
        store.append(draft("key", "v2")).await?;
        store.register_client(None, None).await?;
        store.heartbeat_member("uuid-1", "127.0.0.1:1").await?;

        store.clean_up().await?;

        assert!(
            store
                .list(&EventFilter::default(), Version::ZERO, None)
                .await?
                .is_empty(),
            "backend {name}"
        );
        let event = store.append(draft("key", "v1")).await?;
        assert_eq!(event.version, Version::from(1), "backend {name}");

        let members = store.list_members(60_000).await?;
        assert_eq!(members.len(), 1, "backend {name}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_leadership_single_holder() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let ttl_ms = 200;

        assert!(
            store
                .try_acquire_leadership("peer-1", "127.0.0.1:1", ttl_ms)
                .await?,
            "backend {name}"
        );
        // re-acquiring your own leadership is fine
        assert!(
            store
                .try_acquire_leadership("peer-1", "127.0.0.1:1", ttl_ms)
                .await?,
            "backend {name}"
        );
        // a second peer is blocked while the leader's heartbeat is fresh
        assert!(
            !store
                .try_acquire_leadership("peer-2", "127.0.0.1:2", ttl_ms)
                .await?,
            "backend {name}"
        );

        let members = store.list_members(ttl_ms).await?;
        assert_eq!(
            members.iter().filter(|m| m.is_leader).count(),
            1,
            "backend {name}"
        );

        // after the TTL lapses the second peer takes over
        tokio::time::sleep(Duration::from_millis(ttl_ms + 50)).await;
        assert!(
            store
                .try_acquire_leadership("peer-2", "127.0.0.1:2", ttl_ms)
                .await?,
            "backend {name}"
        );
        let members = store.list_members(ttl_ms).await?;
        let leader = members.iter().find(|m| m.is_leader).unwrap();
        assert_eq!(leader.uuid, "peer-2", "backend {name}");

        // resignation clears the flag
        store.resign_leadership("peer-2").await?;
        assert!(
            store.list_members(ttl_ms).await?.iter().all(|m| !m.is_leader),
            "backend {name}"
        );
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_live_feed_sees_committed_appends() -> BoxedErrorResult<()> {
    for (name, store) in all_stores().await? {
        let mut feed = store.subscribe_events();
        let appended = store.append(draft("key", "v1")).await?;

        let received = feed.recv().await?;
        assert_eq!(received, appended, "backend {name}");

        // the event the feed announced is already visible to reads
        let listed = store
            .list(&EventFilter::default(), Version::ZERO, None)
            .await?;
        assert_eq!(listed, vec![received], "backend {name}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_durable_store_survives_reopen() -> BoxedErrorResult<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.redb");

    {
        let store = Database::open(path.clone()).await?;
        store.append(draft("key", "v1")).await?;
        store.append(draft("key", "v2")).await?;
    }

    let store = Database::open(path).await?;
    let events = store
        .list(&EventFilter::default(), Version::ZERO, None)
        .await?;
    assert_eq!(events.len(), 2);
    let event = store.append(draft("key", "v3")).await?;
    assert_eq!(event.version, Version::from(3));

    Ok(())
}
