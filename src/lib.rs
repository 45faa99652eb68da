//! ## userstream
//! Streams user profiles from a public API through Kafka into ClickHouse.
//!
//! Two independent processes share one topic:
//! * the [producer] fetches profiles for a fixed time window, gives each a
//!   fresh id and publishes it keyed by that id;
//! * the [ingester] reads every partition in order, validates each message
//!   against the record schema and upserts it into a table keyed by id.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! [kafka]
//! brokers = "localhost:9092"
//! topic = "users_created"
//! client = { "session.timeout.ms" = 6000 }
//!
//! [clickhouse]
//! url = "tcp://localhost:9000"
//! database = "spark_streams"
//! table = "created_users"
//!
//! [consumer]
//! codec = "json"                  # or "avro", must match the producer
//! checkpoint_path = "/var/lib/userstream/checkpoint.json"
//! retry = { max_retries = 5, initial_backoff_ms = 100 }
//!
//! [dead_letter]
//! kind = "file"                   # or "kafka", topic defaults to "<topic>.dlq"
//! path = "/var/lib/userstream/dlq.jsonl"
//! ```
//! Any value can be overridden from the environment, e.g.
//! `USERSTREAM__KAFKA__BROKERS=broker:9092`.
//!
//! ## Delivery
//! Writes are upserts keyed by record id, so redelivery is harmless. A
//! partition's checkpoint only advances once a message is either stored or
//! dead-lettered; undecodable and invalid messages are dead-lettered and
//! skipped, while a store that stays unavailable past the retry budget stops
//! the consumer without losing its place.
//!
//! ## Codecs
//! Payload formats are implementations of [Codec], looked up by name with
//! [get_codec]. The [json] codec is the default, [avro] carries its writer
//! schema in every message.
//!
//! [Codec]: codec::Codec
//! [get_codec]: codec::get_codec
//! [json]: codec::json
//! [avro]: codec::avro

pub mod bootstrap;
pub mod checkpoint;
pub mod codec;
pub mod dead_letter;
pub mod ingester;
pub mod producer;
pub mod record;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod sink;
