use super::*;
use crate::sync::dedup::MAX_WINDOW;
use std::collections::HashMap;
use tempfile::tempdir;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

const REQUIRED: [(&str, &str); 3] = [
    ("DRIVEMIRROR_TOKEN", "secret"),
    ("DRIVEMIRROR_ROOT_ID", "root-folder"),
    ("DRIVEMIRROR_BUCKET", "mirror-bucket"),
];

#[test]
fn expands_tilde_to_home_db_path() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/state/mirror.db", &home),
        PathBuf::from("/tmp/home-user/state/mirror.db")
    );
    assert_eq!(expand_with_home("/var/lib/m.db", &home), PathBuf::from("/var/lib/m.db"));
}

#[test]
fn numeric_vars_fall_back_on_garbage_and_zero() {
    let lookup = lookup_from(&[("A", "12"), ("B", "zero"), ("C", "0")]);
    assert_eq!(read_u64_var(&lookup, "A", 42), 12);
    assert_eq!(read_u64_var(&lookup, "B", 42), 42);
    assert_eq!(read_u64_var(&lookup, "C", 42), 42);
    assert_eq!(read_u64_var(&lookup, "MISSING", 42), 42);
}

#[test]
fn change_feed_is_enabled_by_default() {
    let lookup = lookup_from(&[("OFF", "no")]);
    assert!(read_bool_var(&lookup, "MISSING", true));
    assert!(!read_bool_var(&lookup, "OFF", true));
}

#[test]
fn config_applies_defaults() {
    let config = DaemonConfig::from_lookup(lookup_from(&REQUIRED)).unwrap();

    assert_eq!(config.root_id, "root-folder");
    assert_eq!(config.drive_url, "https://www.googleapis.com");
    assert_eq!(config.storage_url, "https://storage.googleapis.com");
    assert_eq!(config.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    assert_eq!(config.poll_interval, Duration::from_secs(300));
    assert_eq!(config.poll_lookback, Duration::from_secs(300));
    assert_eq!(config.dedup_window, Duration::from_secs(300));
    assert_eq!(config.dedup_bucket, Duration::from_secs(30));
    assert_eq!(config.retry_max_attempts, 5);
    assert_eq!(config.walk_concurrency, 4);
    assert!(config.use_change_feed);
    assert_eq!(config.watch_ttl, Duration::from_secs(86_400));
    assert!(config.db_path.ends_with("drivemirror/state.db"));
}

#[test]
fn config_reads_overrides() {
    let mut pairs = REQUIRED.to_vec();
    pairs.extend([
        ("DRIVEMIRROR_LISTEN", "127.0.0.1:9000"),
        ("DRIVEMIRROR_POLL_SECS", "60"),
        ("DRIVEMIRROR_RETRY_MAX_ATTEMPTS", "9"),
        ("DRIVEMIRROR_CHANGE_FEED", "false"),
        ("DRIVEMIRROR_DB", "/srv/mirror/state.db"),
    ]);

    let config = DaemonConfig::from_lookup(lookup_from(&pairs)).unwrap();

    assert_eq!(config.listen.port(), 9000);
    assert_eq!(config.poll_interval, Duration::from_secs(60));
    assert_eq!(config.retry_max_attempts, 9);
    assert!(!config.use_change_feed);
    assert_eq!(config.db_path, PathBuf::from("/srv/mirror/state.db"));
}

#[test]
fn config_requires_token_root_and_bucket() {
    let err = DaemonConfig::from_lookup(lookup_from(&REQUIRED[1..])).unwrap_err();
    assert!(err.to_string().contains("DRIVEMIRROR_TOKEN"));

    let err = DaemonConfig::from_lookup(lookup_from(&[
        ("DRIVEMIRROR_TOKEN", "secret"),
        ("DRIVEMIRROR_ROOT_ID", " "),
        ("DRIVEMIRROR_BUCKET", "b"),
    ]))
    .unwrap_err();
    assert!(err.to_string().contains("DRIVEMIRROR_ROOT_ID"));
}

#[test]
fn invalid_listen_address_is_rejected() {
    let mut pairs = REQUIRED.to_vec();
    pairs.push(("DRIVEMIRROR_LISTEN", "not-an-address"));
    assert!(DaemonConfig::from_lookup(lookup_from(&pairs)).is_err());
}

#[test]
fn channel_ids_are_unique_hex() {
    let first = random_channel_id();
    let second = random_channel_id();
    assert_ne!(first, second);
    assert!(first.starts_with("drivemirror-"));
    assert_eq!(first.len(), "drivemirror-".len() + 32);
}

fn config_against(server: &MockServer, db: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::from_lookup(lookup_from(&REQUIRED)).unwrap();
    config.drive_url = server.uri();
    config.storage_url = server.uri();
    config.db_path = db.to_path_buf();
    config
}

async fn runtime_against(server: &MockServer, db: &Path) -> DaemonRuntime {
    DaemonRuntime::bootstrap(config_against(server, db)).await.unwrap()
}

#[tokio::test]
async fn oversized_dedup_window_is_clamped_at_bootstrap() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut config = config_against(&server, &dir.path().join("state.db"));
    config.dedup_window = Duration::from_secs(u64::MAX);
    config.dedup_bucket = Duration::from_secs(u64::MAX);

    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    let dedup = runtime.engine().deduplicator();
    let signature = dedup.signature_for("n1", OffsetDateTime::now_utc());

    assert_eq!(dedup.window(), MAX_WINDOW);
    assert!(dedup.should_process(&signature));
    assert!(!dedup.should_process(&signature));
}

#[tokio::test]
async fn oversized_watch_ttl_is_an_error_not_a_panic() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut config = config_against(&server, &dir.path().join("state.db"));
    config.watch_ttl = Duration::from_secs(u64::MAX);
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    runtime
        .engine()
        .watermark()
        .set_change_cursor("5")
        .await
        .unwrap();

    let err = runtime.register_watch("https://m.example/n").await.unwrap_err();

    assert!(err.to_string().contains("watch ttl"));
}

#[tokio::test]
async fn run_fails_on_taken_address_without_starting_background_work() {
    let server = MockServer::start().await;
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dir = tempdir().unwrap();
    let mut config = config_against(&server, &dir.path().join("state.db"));
    config.listen = taken.local_addr().unwrap();
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();

    let err = runtime.run().await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(err.to_string().contains("failed to bind"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn register_watch_seeds_cursor_and_registers_channel() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/changes/startPageToken"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "startPageToken": "77"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/changes/watch"))
        .and(query_param("pageToken", "77"))
        .and(body_partial_json(serde_json::json!({
            "type": "web_hook",
            "address": "https://mirror.example/notifications"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "drivemirror-abc",
            "resourceId": "res-1",
            "expiration": "1704153600000"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = runtime_against(&server, &dir.path().join("state.db")).await;

    let channel = runtime
        .register_watch("https://mirror.example/notifications")
        .await
        .unwrap();

    assert_eq!(channel.resource_id, "res-1");
    assert_eq!(
        runtime
            .engine()
            .watermark()
            .change_cursor()
            .await
            .unwrap()
            .as_deref(),
        Some("77")
    );
}

#[tokio::test]
async fn register_watch_reuses_stored_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/changes/watch"))
        .and(query_param("pageToken", "12"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "drivemirror-abc",
            "resourceId": "res-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = runtime_against(&server, &dir.path().join("state.db")).await;
    runtime
        .engine()
        .watermark()
        .set_change_cursor("12")
        .await
        .unwrap();

    let channel = runtime.register_watch("https://mirror.example/n").await.unwrap();

    assert_eq!(channel.resource_id, "res-2");
}

#[tokio::test]
async fn stop_watch_posts_channel_identity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/channels/stop"))
        .and(body_partial_json(serde_json::json!({
            "id": "chan-1",
            "resourceId": "res-1"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = runtime_against(&server, &dir.path().join("state.db")).await;

    runtime.stop_watch("chan-1", "res-1").await.unwrap();
}

#[tokio::test]
async fn bootstrapped_engine_mirrors_through_http_stores() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "files": [{
                "id": "f1",
                "name": "notes.txt",
                "mimeType": "text/plain",
                "modifiedTime": "2024-03-01T00:00:00Z",
                "parents": ["root-folder"],
                "trashed": false
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/mirror-bucket/o"))
        .and(query_param("name", "notes.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "notes.txt"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let runtime = runtime_against(&server, &dir.path().join("state.db")).await;

    let stats = runtime.engine().sync_manual().await.unwrap();

    assert_eq!((stats.ok, stats.fail), (1, 0));
}
