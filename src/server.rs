//! Network servers.

mod prom;

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

use crate::config::Config;

pub use prom::spawn_prom_server;

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("topic", config.topic.clone())
            .add_global_label("group", config.group.clone())
            .build()
    })
}
