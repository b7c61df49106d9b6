use pglogical_capture::config::SourceConfig;
use std::env;

/// Control and replication connection strings from `TEST_PG_*` variables.
pub fn test_source_config() -> SourceConfig {
    let host = env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("TEST_PG_PORT").unwrap_or_else(|_| "5432".to_string());
    let database = env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string());
    let username = env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string());

    let conn_str = format!(
        "host={} port={} dbname={} user={} password={}",
        host, port, database, username, password
    );

    let mut config = SourceConfig::new(
        conn_str.clone(),
        format!("{} replication=database", conn_str),
        format!("test_slot_{}", std::process::id()),
    );
    config.create_slot = true;
    config.report_interval_secs = 1;
    config.connect_timeout_secs = 10;
    config
}

/// A source config pointing at a port nothing listens on.
pub fn unreachable_source_config() -> SourceConfig {
    let mut config = SourceConfig::new(
        "host=127.0.0.1 port=1 user=postgres dbname=postgres",
        "host=127.0.0.1 port=1 user=postgres dbname=postgres replication=database",
        "unreachable_slot",
    );
    config.connect_timeout_secs = 5;
    config
}
