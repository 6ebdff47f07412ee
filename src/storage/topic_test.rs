use anyhow::{Context, Result};

use crate::config::Config;
use crate::database::Database;
use crate::fixtures;
use crate::models::PartitionId;
use crate::storage::topic::{cursor_key, PREFIX_PARTITION};
use crate::storage::{BatchReader, CursorStore, PartitionSource, TopicStore};
use crate::utils;

#[tokio::test]
async fn open_empty_topic_has_no_partitions() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;

    let store = TopicStore::open(db, &config.topic).await?;

    assert!(store.current_partitions().is_empty(), "expected no partitions, got {:?}", store.current_partitions());
    assert_eq!(store.topic(), config.topic.as_str(), "expected topic {}, got {}", config.topic, store.topic());
    Ok(())
}

#[tokio::test]
async fn create_partition_signals_discovery_and_is_idempotent() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopicStore::open(db.clone(), &config.topic).await?;
    let mut watcher = store.watch_partitions();

    let created = store.create_partition(PartitionId(3)).await?;
    let created_again = store.create_partition(PartitionId(3)).await?;

    assert!(created, "expected first create to report a new partition");
    assert!(!created_again, "expected second create to be a no-op");
    tokio::time::timeout(std::time::Duration::from_secs(5), watcher.changed())
        .await
        .context("timeout waiting for partition watch")??;
    let seen = watcher.borrow().clone();
    assert!(seen.contains(&PartitionId(3)), "expected watcher to observe partition 3, got {:?}", seen);

    let tree = db.get_topic_tree_metadata(&config.topic).await?;
    let record = tree.get(utils::encode_byte_prefix_u32(PREFIX_PARTITION, 3)).context("error fetching partition record")?;
    assert!(record.is_some(), "expected partition record to be written to disk");
    Ok(())
}

#[tokio::test]
async fn publish_then_read_batches_respect_max_messages() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopicStore::open(db, &config.topic).await?;
    store.ensure_partitions(1).await?;
    let partition = PartitionId(0);

    let last_offset = fixtures::publish_count(&store, partition, 75).await?;
    let first = store.read(partition, 0, 50).await?;
    let second = store.read(partition, first.next_offset(), 50).await?;
    let third = store.read(partition, second.next_offset(), 50).await?;

    assert_eq!(last_offset, 74, "expected last offset 74, got {}", last_offset);
    assert_eq!(first.size(), 50, "expected first batch of 50, got {}", first.size());
    assert_eq!(first.start_offset(), 0, "expected first batch to start at 0, got {}", first.start_offset());
    assert_eq!(first.next_offset(), 50, "expected first batch next offset 50, got {}", first.next_offset());
    assert_eq!(second.size(), 25, "expected second batch of 25, got {}", second.size());
    assert_eq!(second.next_offset(), 75, "expected second batch next offset 75, got {}", second.next_offset());
    assert!(third.is_empty(), "expected third batch to be empty, got {}", third.size());
    assert_eq!(third.next_offset(), 75, "expected empty batch to keep next offset 75, got {}", third.next_offset());
    let offsets: Vec<u64> = second.iter().map(|msg| msg.offset).collect();
    assert_eq!(offsets, (50..75).collect::<Vec<_>>(), "expected sequential offsets in second batch");
    Ok(())
}

#[tokio::test]
async fn publish_to_unknown_partition_fails() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopicStore::open(db, &config.topic).await?;

    let res = store.publish(PartitionId(9), vec![b"data".to_vec()]).await;

    assert!(res.is_err(), "expected publish to an unknown partition to fail");
    Ok(())
}

#[tokio::test]
async fn reopen_recovers_partitions_and_offsets() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopicStore::open(db.clone(), &config.topic).await?;
    store.ensure_partitions(2).await?;
    let last_offset = fixtures::setup_partition_data(&store, PartitionId(1)).await?;
    drop(store);

    let store = TopicStore::open(db, &config.topic).await?;

    let partitions = store.current_partitions();
    assert_eq!(partitions.len(), 2, "expected 2 recovered partitions, got {:?}", partitions);
    let next_offset = store.next_offset(PartitionId(1)).await?;
    assert_eq!(next_offset, last_offset + 1, "expected next offset {}, got {}", last_offset + 1, next_offset);
    let next_offset = store.next_offset(PartitionId(0)).await?;
    assert_eq!(next_offset, 0, "expected empty partition next offset 0, got {}", next_offset);
    Ok(())
}

#[tokio::test]
async fn cursors_default_to_zero_and_are_scoped_by_group() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = TopicStore::open(db.clone(), &config.topic).await?;
    let partition = PartitionId(0);

    let initial = store.get_cursor(partition, "group-a").await?;
    store.set_cursor(partition, "group-a", 2500).await?;
    let group_a = store.get_cursor(partition, "group-a").await?;
    let group_b = store.get_cursor(partition, "group-b").await?;
    let other_partition = store.get_cursor(PartitionId(1), "group-a").await?;

    assert_eq!(initial, 0, "expected default cursor 0, got {}", initial);
    assert_eq!(group_a, 2500, "expected group-a cursor 2500, got {}", group_a);
    assert_eq!(group_b, 0, "expected group-b cursor 0, got {}", group_b);
    assert_eq!(other_partition, 0, "expected partition 1 cursor 0, got {}", other_partition);

    let tree = db.get_topic_tree_metadata(&config.topic).await?;
    let raw = tree
        .get(cursor_key(partition, "group-a"))
        .context("error fetching cursor record")?
        .context("expected cursor record to be on disk")?;
    assert_eq!(utils::decode_u64(&raw)?, 2500, "expected on-disk cursor to be 2500");
    Ok(())
}
