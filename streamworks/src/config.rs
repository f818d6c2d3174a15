use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct RuntimeConfig {
    /// Application id, the prefix of derived topic names (changelogs) and
    /// the default consumer group prefix.
    #[envconfig(default = "streamworks")]
    pub app_id: String,

    /// Broker to bind, resolved to a transport by URL scheme.
    #[envconfig(default = "kafka://localhost:9092")]
    pub broker_url: String,

    /// Milliseconds between commit attempts.
    #[envconfig(default = "2500")]
    pub commit_interval_ms: u64,

    /// Default autoack flag; consumers can override it per topic.
    #[envconfig(default = "true")]
    pub autoack: bool,

    /// Backing store for tables that don't name their own.
    #[envconfig(default = "memory://")]
    pub store_url: String,
}

impl RuntimeConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}

/// Tuning for the Kafka driver; separate from RuntimeConfig so non-Kafka
/// deployments don't carry it.
#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // We default to "earliest": a consumer group seeing a partition for the
    // first time starts from the beginning of the log.
    #[envconfig(default = "earliest")]
    pub kafka_offset_reset: String, // earliest, latest
}
