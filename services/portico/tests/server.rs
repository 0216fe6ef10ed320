//! Process lifecycle: initial apply, reload, shutdown.

mod common;

use std::time::Duration;

use common::{free_port, loopback, probe_bind, temp_dir};
use portico::config::Config;
use portico::hub::Overrides;
use portico::log::LogHandle;
use portico::server::Server;
use portico_events::Observable;

fn server(path: std::path::PathBuf) -> Server {
    Server::new(path, Overrides::default(), LogHandle::detached(Observable::new(16)))
}

async fn wait_bound(port: u16) {
    for _ in 0..100 {
        if !probe_bind(loopback(port)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("port {port} never bound");
}

#[tokio::test]
async fn serve_applies_reloads_and_shuts_down() {
    let dir = temp_dir("portico-server");
    let path = dir.join("config.yaml");
    let mixed = free_port();
    let api = free_port();
    std::fs::write(
        &path,
        format!("mixed-port: {mixed}\nexternal-controller: 127.0.0.1:{api}\n"),
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    let server = server(path.clone());
    let shutdown = server.shutdown_token();
    let hub = server.hub();
    let task = tokio::spawn(server.serve(config));

    wait_bound(mixed).await;
    wait_bound(api).await;
    assert_eq!(hub.ports().mixed_port, mixed);

    let socks = free_port();
    std::fs::write(
        &path,
        format!("socks-port: {socks}\nexternal-controller: 127.0.0.1:{api}\n"),
    )
    .unwrap();
    hub.reload().await.unwrap();
    assert!(probe_bind(loopback(mixed)));
    assert!(!probe_bind(loopback(socks)));

    // A broken file leaves the running listeners alone.
    std::fs::write(&path, "").unwrap();
    assert!(hub.reload().await.is_err());
    assert!(!probe_bind(loopback(socks)));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(15), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(probe_bind(loopback(socks)));
    assert!(probe_bind(loopback(api)));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn api_bind_failure_is_fatal_before_listeners_start() {
    let dir = temp_dir("portico-server");
    let path = dir.join("config.yaml");
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let api = taken.local_addr().unwrap().port();
    let mixed = free_port();
    std::fs::write(
        &path,
        format!("mixed-port: {mixed}\nexternal-controller: 127.0.0.1:{api}\n"),
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    let result = server(path).serve(config).await;

    assert!(result.is_err());
    assert!(probe_bind(loopback(mixed)));

    std::fs::remove_dir_all(&dir).unwrap();
}
