use std::time::Duration;

use anyhow::Result;

use crate::config::{Config, DEFAULT_LOCK_ACK_RETRY_SECS, DEFAULT_LOCK_ACK_TIMEOUT_SECS, DEFAULT_MAX_BATCH_SIZE};
use crate::distributor::DistributorKind;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("METRICS_PORT".into(), "9090".into()),
        ("TOPIC".into(), "events".into()),
        ("GROUP".into(), "billing".into()),
        ("PARTITIONS".into(), "12".into()),
        ("LOCAL_MEMBERS".into(), "3".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/hadron-lease/data".into()),
        ("DISTRIBUTOR".into(), "dealer".into()),
        ("MAX_BATCH_SIZE".into(), "500".into()),
        ("LOCK_ACK_TIMEOUT_SECS".into(), "10".into()),
        ("LOCK_ACK_RETRY_SECS".into(), "0".into()),
        ("READER_IDLE_MS".into(), "50".into()),
        ("READER_RETRY_MS".into(), "200".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.metrics_port == 9090, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 9090);
    assert!(config.topic == "events", "unexpected value parsed for TOPIC, got {}, expected {}", config.topic, "events");
    assert!(config.group == "billing", "unexpected value parsed for GROUP, got {}, expected {}", config.group, "billing");
    assert!(config.partitions == 12, "unexpected value parsed for PARTITIONS, got {}, expected {}", config.partitions, 12);
    assert!(config.local_members == 3, "unexpected value parsed for LOCAL_MEMBERS, got {}, expected {}", config.local_members, 3);
    assert!(
        config.storage_data_path == "/usr/local/hadron-lease/data",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/hadron-lease/data"
    );
    assert!(
        config.distributor == DistributorKind::Dealer,
        "unexpected value parsed for DISTRIBUTOR, got {:?}, expected {:?}",
        config.distributor,
        DistributorKind::Dealer
    );
    assert!(config.max_batch_size == 500, "unexpected value parsed for MAX_BATCH_SIZE, got {}, expected {}", config.max_batch_size, 500);
    assert!(
        config.lock_ack_timeout() == Duration::from_secs(10),
        "unexpected value parsed for LOCK_ACK_TIMEOUT_SECS, got {:?}, expected {:?}",
        config.lock_ack_timeout(),
        Duration::from_secs(10)
    );
    assert!(
        config.lock_ack_retry().is_none(),
        "expected LOCK_ACK_RETRY_SECS=0 to disable retries, got {:?}",
        config.lock_ack_retry()
    );
    assert!(
        config.reader_idle() == Duration::from_millis(50),
        "unexpected value parsed for READER_IDLE_MS, got {:?}, expected {:?}",
        config.reader_idle(),
        Duration::from_millis(50)
    );
    assert!(
        config.reader_retry() == Duration::from_millis(200),
        "unexpected value parsed for READER_RETRY_MS, got {:?}, expected {:?}",
        config.reader_retry(),
        Duration::from_millis(200)
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "error".into()), ("TOPIC".into(), "events".into())])?;
    config.validate()?;

    assert!(config.topic == "events", "unexpected value parsed for TOPIC, got {}, expected {}", config.topic, "events");
    assert!(config.group == "default", "unexpected default for GROUP, got {}, expected {}", config.group, "default");
    assert!(config.partitions == 1, "unexpected default for PARTITIONS, got {}, expected {}", config.partitions, 1);
    assert!(config.local_members == 1, "unexpected default for LOCAL_MEMBERS, got {}, expected {}", config.local_members, 1);
    assert!(
        config.storage_data_path == crate::database::DEFAULT_DATA_PATH,
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        crate::database::DEFAULT_DATA_PATH
    );
    assert!(
        config.distributor == DistributorKind::Modulo,
        "unexpected default for DISTRIBUTOR, got {:?}, expected {:?}",
        config.distributor,
        DistributorKind::Modulo
    );
    assert!(
        config.max_batch_size == DEFAULT_MAX_BATCH_SIZE,
        "unexpected default for MAX_BATCH_SIZE, got {}, expected {}",
        config.max_batch_size,
        DEFAULT_MAX_BATCH_SIZE
    );
    assert!(
        config.lock_ack_timeout() == Duration::from_secs(DEFAULT_LOCK_ACK_TIMEOUT_SECS),
        "unexpected default for LOCK_ACK_TIMEOUT_SECS, got {:?}",
        config.lock_ack_timeout()
    );
    assert!(
        config.lock_ack_retry() == Some(Duration::from_secs(DEFAULT_LOCK_ACK_RETRY_SECS)),
        "unexpected default for LOCK_ACK_RETRY_SECS, got {:?}",
        config.lock_ack_retry()
    );

    Ok(())
}

#[test]
fn config_validation_rejects_zero_batch_size() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("TOPIC".into(), "events".into()),
        ("MAX_BATCH_SIZE".into(), "0".into()),
    ])?;

    let res = config.validate();

    assert!(res.is_err(), "expected validation to fail for MAX_BATCH_SIZE=0");
    Ok(())
}

#[test]
fn config_validation_rejects_empty_topic() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "error".into()), ("TOPIC".into(), "".into())])?;

    let res = config.validate();

    assert!(res.is_err(), "expected validation to fail for an empty TOPIC");
    Ok(())
}
