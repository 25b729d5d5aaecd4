#![allow(dead_code)]

use pg_truck::{Config, Replicator};
use std::env;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Connection URL built from TEST_PG_* environment variables.
pub fn test_url() -> String {
    let host = env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("TEST_PG_PORT").unwrap_or_else(|_| "5432".to_string());
    let database = env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string());
    let username = env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    format!(
        "postgres://{}:{}@{}:{}/{}",
        username, password, host, port, database
    )
}

/// Suffix unique to this test process and call.
pub fn unique_suffix() -> String {
    format!(
        "{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub async fn connect() -> Client {
    let (client, connection) = tokio_postgres::connect(&test_url(), NoTls)
        .await
        .expect("test database reachable");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("test connection error: {}", e);
        }
    });
    client
}

/// Source and warehouse connections on the test database, with a slot and
/// publication private to the test.
pub fn connections_toml(slot: &str, publication: &str) -> String {
    format!(
        r#"
[connections.source]
url = "{url}"
slot = "{slot}"
publication = "{publication}"

[connections.warehouse]
url = "{url}"

[replication]
heartbeat_interval_secs = 1
backfill_batch_size = 2
queue_capacity = 4
"#,
        url = test_url(),
        slot = slot,
        publication = publication
    )
}

/// A pipeline copying `source` into `target`, keyed by `id`.
pub fn copy_pipeline_toml(name: &str, source: &str, target: &str, read_update: Option<&str>) -> String {
    let read = match read_update {
        Some(template) => format!("\n[pipelines.read]\nupdate = \"{}\"\n", template),
        None => String::new(),
    };
    format!(
        r#"
[[pipelines]]
name = "{name}"
input = "source"
tables = ["public.{source}"]
{read}
[pipelines.write]
output = "warehouse"
truncate = "public.{target}"
insert = "INSERT INTO {target} (id, name) SELECT id, name FROM {{{{rows}}}} r"
update = "UPDATE {target} t SET name = r.name FROM {{{{rows}}}} r WHERE t.id = r.old__id"
delete = "DELETE FROM {target} t USING {{{{rows}}}} r WHERE t.id = r.old__id"
"#,
        name = name,
        source = source,
        target = target,
        read = read
    )
}

pub fn load_config(contents: &str) -> Config {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    Config::from_file(file.path()).expect("valid test configuration")
}

pub struct Running {
    pub shutdown: CancellationToken,
    pub task: JoinHandle<pg_truck::Result<()>>,
}

pub fn start(config: Config) -> Running {
    let replicator = Replicator::new(config);
    let shutdown = replicator.shutdown_token();
    let task = tokio::spawn(async move { replicator.run().await });
    Running { shutdown, task }
}

impl Running {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(30), self.task)
            .await
            .expect("replicator stops in time")
            .expect("replicator task joins");
        result.expect("replicator exits cleanly");
    }
}

/// Polls `query` until its single bigint column equals `expected`.
pub async fn wait_for_count(client: &Client, query: &str, expected: i64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if let Ok(row) = client.query_one(query, &[]).await {
            if row.get::<_, i64>(0) == expected {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

/// Drops the slot, the publication and any listed tables. The slot may stay
/// active for a moment after the replicator disconnects.
pub async fn cleanup(client: &Client, slot: &str, publication: &str, tables: &[&str]) {
    for _ in 0..25 {
        let dropped = client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await;
        if dropped.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    client
        .batch_execute(&format!("DROP PUBLICATION IF EXISTS {}", publication))
        .await
        .ok();
    for table in tables {
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", table))
            .await
            .ok();
    }
}
