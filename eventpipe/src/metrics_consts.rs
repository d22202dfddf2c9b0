// ==== Consumer metrics, labelled by channel and partition ====
pub const CONSUMER_EVENTS_RECEIVED: &str = "eventpipe_consumer_events_received_total";
pub const CONSUMER_LAG_TOTAL: &str = "eventpipe_consumer_lag_total";
pub const CONSUMER_ERRORS: &str = "eventpipe_consumer_errors_total";
pub const CONSUMER_REBALANCING: &str = "eventpipe_consumer_rebalancing_total";
pub const CONSUMER_CHECKPOINTS: &str = "eventpipe_consumer_checkpoints_total";
pub const CONSUMER_SKIPPED: &str = "eventpipe_consumer_skipped_events_total";
pub const CONSUMER_HEALTH_PROBES: &str = "eventpipe_consumer_health_probes_total";
pub const CONSUMER_PARTITIONS_INITIALIZED: &str = "eventpipe_consumer_partitions_initialized_total";

// ==== Producer metrics, labelled by channel ====
pub const PRODUCER_EVENTS_SENT: &str = "eventpipe_producer_events_sent_total";
pub const PRODUCER_SEND_ERRORS: &str = "eventpipe_producer_send_errors_total";
pub const PRODUCER_EVENTS_DROPPED: &str = "eventpipe_producer_events_dropped_total";
pub const PRODUCER_BATCH_SIZE: &str = "eventpipe_producer_batch_size";
pub const PRODUCER_RETRY_BUFFER_SIZE: &str = "eventpipe_producer_retry_buffer_size";
pub const PRODUCER_ITEMS_RECYCLED: &str = "eventpipe_producer_items_recycled_total";
