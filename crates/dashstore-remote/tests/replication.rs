//! Integration tests: repository replication over a real TCP socket.
//!
//! Each test starts a server on an ephemeral port and talks to it through
//! `RepositoryClient`.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use dashstore_core::{Config, DataEvent, DataRepository, Value};
use dashstore_remote::{RemoteError, RepositoryClient, RepositoryServer, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_repo() -> Arc<DataRepository> {
    test_repo_with(Config::testing())
}

fn test_repo_with(mut config: Config) -> Arc<DataRepository> {
    config.synchronous_notify = true;
    let repo = DataRepository::new(config).unwrap();
    repo.start_workers().unwrap();
    repo
}

fn start_server(repo: &Arc<DataRepository>) -> RepositoryServer {
    let settings = BTreeMap::from([("user.name".to_string(), "tester".to_string())]);
    RepositoryServer::start(Arc::clone(repo), ServerConfig { bind_addr: "127.0.0.1:0".into(), settings }).unwrap()
}

fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[test]
fn test_handshake_by_datafile_id() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("proj.dat");
    fs::write(&path, "Size=10\n").unwrap();
    let repo = test_repo();
    repo.open_datafile("/Project/Widget", &path).unwrap();
    let server = start_server(&repo);

    let id = repo.get_id("/Project/Widget").unwrap();
    let client = RepositoryClient::connect(server.local_addr(), &id, "").unwrap();
    assert_eq!(client.data_path(), "/Project/Widget");
    assert_eq!(client.settings().get("user.name").map(String::as_str), Some("tester"));
}

#[test]
fn test_handshake_by_path_and_unknown_id() {
    let repo = test_repo();
    let server = start_server(&repo);

    let client = RepositoryClient::connect(server.local_addr(), "/Project/My%20Thing", "").unwrap();
    assert_eq!(client.data_path(), "/Project/My Thing");

    let client = RepositoryClient::connect(server.local_addr(), "12345", "").unwrap();
    assert_eq!(client.data_path(), "//anonymous//");
}

#[test]
fn test_required_tag() {
    let repo = test_repo();
    let server = start_server(&repo);

    let err = RepositoryClient::connect(server.local_addr(), "/Project", "Team Tag").err().unwrap();
    assert!(matches!(err, RemoteError::Forbidden { ref path, ref tag } if path == "/Project" && tag == "Team Tag"));

    repo.put("/Project/Team Tag", Value::Tag);
    assert!(RepositoryClient::connect(server.local_addr(), "/Project", "Team Tag").is_ok());
}

// ---------------------------------------------------------------------------
// Commands and events
// ---------------------------------------------------------------------------

#[test]
fn test_subscribe_receives_initial_and_changed_values() {
    let repo = test_repo();
    repo.put("/p/A", Value::number(1.0));
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();

    client.add_data_listener("/p/A").unwrap();
    assert!(client.wait_for("/p/A", WAIT, |v| v == Some(&Value::number(1.0))));

    repo.put("/p/A", Value::number(2.0));
    assert!(client.wait_for("/p/A", WAIT, |v| v == Some(&Value::number(2.0))));

    repo.remove_value("/p/A");
    assert!(client.wait_for("/p/A", WAIT, |v| v.is_none()));
}

#[test]
fn test_each_subscriber_gets_one_batch_per_change() {
    let repo = test_repo();
    repo.put("/p/A", Value::number(1.0));
    let server = start_server(&repo);
    let clients: Vec<RepositoryClient> =
        (0..2).map(|_| RepositoryClient::connect(server.local_addr(), "/p", "").unwrap()).collect();
    for client in &clients {
        client.add_data_listener("/p/A").unwrap();
        assert!(client.wait_for("/p/A", WAIT, |v| v.is_some()));
        while client.next_events(Duration::from_millis(100)).is_some() {}
    }

    repo.put("/p/A", Value::number(2.0));
    for client in &clients {
        let batch = client.next_events(WAIT).unwrap();
        assert_eq!(batch, vec![DataEvent::value_changed("/p/A", Some(Value::number(2.0)))]);
        assert!(client.next_events(Duration::from_millis(100)).is_none());
    }
}

#[test]
fn test_client_writes_reach_repository() {
    let repo = test_repo();
    repo.put("/p/B", Value::number(3.0));
    repo.put_text("/p/Total", "!(+ A B)", "/p");
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();

    client.add_data_listener("/p/Total").unwrap();
    client.put_value("/p/A", &Value::number(4.0)).unwrap();
    assert!(client.wait_for("/p/Total", WAIT, |v| v.and_then(Value::as_number) == Some(7.0)));

    client.maybe_create_value("/p/C", "9", "/p").unwrap();
    client.maybe_create_value("/p/B", "100", "/p").unwrap();
    client.remove_value("/p/A").unwrap();
    assert!(eventually(|| repo.get("/p/C") == Some(Value::number(9.0)) && repo.get("/p/A").is_none()));
    assert_eq!(repo.get("/p/B"), Some(Value::number(3.0)));
}

#[test]
fn test_read_only_values_not_overwritten_remotely() {
    let repo = test_repo();
    repo.put("/p/Locked", Value::number(1.0).with_editable(false));
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();

    client.put_value("/p/Locked", &Value::number(2.0)).unwrap();
    client.put_value("/p/Open", &Value::number(2.0)).unwrap();
    assert!(eventually(|| repo.get("/p/Open").is_some()));
    assert_eq!(repo.get("/p/Locked").and_then(|v| v.as_number()), Some(1.0));
}

#[test]
fn test_restore_default_token() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("base.txt"), "Size=5\n").unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "#include <base.txt>\nSize=8\n").unwrap();
    let repo = test_repo_with(Config::testing().with_template_dir(dir.path()));
    repo.open_datafile("/p", &path).unwrap();
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();

    client.restore_default("/p/Size").unwrap();
    assert!(eventually(|| repo.get("/p/Size") == Some(Value::number(5.0))));
}

#[test]
fn test_list_data_names() {
    let repo = test_repo();
    for name in ["/p/b", "/p/a", "/q/c"] {
        repo.put(name, Value::number(1.0));
    }
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();
    assert_eq!(client.list_data_names("/p/", WAIT).unwrap(), vec!["/p/a".to_string(), "/p/b".to_string()]);
}

#[test]
fn test_null_read_only_value_is_redacted() {
    let repo = test_repo();
    repo.put_text("/p/Broken", "12abc", "/p");
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();

    client.add_data_listener("/p/Broken").unwrap();
    assert!(client.wait_for("/p/Broken", WAIT, |v| v == Some(&Value::text("").with_editable(false))));
}

#[test]
fn test_log_message_accepted() {
    let repo = test_repo();
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();
    client.log_message("first line\nsecond line").unwrap();
    client.put_value("/p/After", &Value::number(1.0)).unwrap();
    assert!(eventually(|| repo.get("/p/After").is_some()));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn test_disconnect_releases_listeners() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p.dat");
    fs::write(&path, "A=1\n").unwrap();
    let repo = test_repo();
    repo.open_datafile("/p", &path).unwrap();
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();
    client.add_data_listener("/p/A").unwrap();
    client.add_data_listener("/p/Pending").unwrap();
    assert!(eventually(|| repo.listener_count("/p/A") == 1));
    assert!(repo.contains("/p/Pending"));

    client.quit();
    assert!(eventually(|| repo.listener_count("/p/A") == 0 && server.connection_count() == 0));
    assert!(!repo.contains("/p/Pending"));
    assert_eq!(repo.get("/p/A"), Some(Value::number(1.0)));
}

#[test]
fn test_disconnect_discards_unsaved_values() {
    let repo = test_repo();
    repo.put("/p/Scratch", Value::number(1.0));
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();
    client.add_data_listener("/p/Scratch").unwrap();
    assert!(eventually(|| repo.listener_count("/p/Scratch") == 1));

    client.quit();
    assert!(eventually(|| server.connection_count() == 0));
    assert!(eventually(|| !repo.contains("/p/Scratch")));
}

#[test]
fn test_close_connections_for_prefix() {
    let repo = test_repo();
    let server = start_server(&repo);
    let doomed = RepositoryClient::connect(server.local_addr(), "/closing", "").unwrap();
    let survivor = RepositoryClient::connect(server.local_addr(), "/staying", "").unwrap();
    assert!(eventually(|| server.connection_count() == 2));

    assert_eq!(server.close_connections_for("/closing"), 1);
    assert!(eventually(|| !doomed.is_connected()));
    assert!(survivor.is_connected());
    assert!(eventually(|| server.connection_count() == 1));
}

#[test]
fn test_server_shutdown_disconnects_clients() {
    let repo = test_repo();
    let server = start_server(&repo);
    let client = RepositoryClient::connect(server.local_addr(), "/p", "").unwrap();
    server.shutdown();
    assert!(eventually(|| !client.is_connected()));
    assert!(matches!(client.add_data_listener("/p/A"), Err(RemoteError::Disconnected)));
}
