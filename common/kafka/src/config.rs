use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying a message: 20 seconds

    #[envconfig(default = "1000000")]
    pub kafka_producer_message_max_bytes: u32, // Also the byte ceiling of one outbound batch

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    // Drives both liveness reporting and the high watermarks used for lag
    #[envconfig(default = "1000")]
    pub kafka_statistics_interval_ms: u32,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "")]
    pub kafka_client_id: String,
}

impl KafkaConfig {
    /// Settings shared by producers and consumers.
    pub fn client_config(&self) -> rdkafka::ClientConfig {
        let mut client_config = rdkafka::ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set(
                "statistics.interval.ms",
                self.kafka_statistics_interval_ms.to_string(),
            );

        if !self.kafka_client_id.is_empty() {
            client_config.set("client.id", &self.kafka_client_id);
        }

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}
