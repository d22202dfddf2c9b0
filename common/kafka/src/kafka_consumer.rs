use rdkafka::ClientConfig;

use crate::config::KafkaConfig;

/// Client settings for a group consumer whose positions are tracked by the
/// caller's own checkpoint store: librdkafka neither stores nor commits
/// offsets on its own.
pub fn consumer_client_config(config: &KafkaConfig, consumer_group: &str) -> ClientConfig {
    let mut client_config = config.client_config();
    client_config
        .set("group.id", consumer_group)
        .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "60000")
        .set("heartbeat.interval.ms", "5000")
        .set("max.poll.interval.ms", "300000");
    client_config
}
