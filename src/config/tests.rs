//! Configuration loading tests

use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use crate::config::Config;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn defaults_apply_without_a_file() {
    let cfg = Config::default();
    assert_eq!(cfg.server.port, 1883);
    assert_eq!(cfg.server.loopback_port, 1882);
    assert_eq!(cfg.limits.max_connections, 16);
    assert_eq!(cfg.limits.max_topic_nodes, 128);
    assert_eq!(cfg.session.ka_grace_percent, 50);
    assert_eq!(cfg.log.level, "info");
}

#[test]
fn file_values_override_defaults() {
    let file = write_config(
        r#"
        [log]
        level = "debug"

        [server]
        port = 2883
        loopback_port = 0

        [limits]
        max_connections = 4
        rx_buffer = 512
        tx_buffer = 2048

        [session]
        ka_grace_percent = 25
        connect_timeout = "5s"
        "#,
    );

    let cfg = Config::load(file.path()).unwrap();
    assert_eq!(cfg.log.level, "debug");
    assert_eq!(cfg.server.port, 2883);
    assert_eq!(cfg.server.loopback_port, 0);
    assert_eq!(cfg.limits.max_connections, 4);
    assert_eq!(cfg.limits.rx_buffer, 512);
    assert_eq!(cfg.limits.tx_buffer, 2048);
    assert_eq!(cfg.session.ka_grace_percent, 25);
    assert_eq!(cfg.session.connect_timeout, Duration::from_secs(5));

    // Unspecified sections keep their defaults.
    assert_eq!(cfg.limits.max_topic_nodes, 128);
    assert_eq!(cfg.session.recv_timeout, Duration::from_secs(5));
}

#[test]
fn env_substitution_with_default() {
    let file = write_config(
        r#"
        [server]
        port = ${EMBERQ_TEST_UNSET_PORT:-2884}
        "#,
    );

    let cfg = Config::load(file.path()).unwrap();
    assert_eq!(cfg.server.port, 2884);
}

#[test]
fn invalid_values_are_rejected() {
    let file = write_config(
        r#"
        [server]
        port = 0
        "#,
    );
    assert!(Config::load(file.path()).is_err());

    let file = write_config(
        r#"
        [limits]
        rx_buffer = 4
        "#,
    );
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn engine_config_carries_all_limits() {
    let cfg = Config::default();
    let engine = cfg.engine_config();
    assert_eq!(engine.listener_port, cfg.server.port);
    assert_eq!(engine.max_connections, cfg.limits.max_connections);
    assert_eq!(engine.max_topic_nodes, cfg.limits.max_topic_nodes);
    assert_eq!(engine.max_subtop_len, cfg.limits.max_subtop_len);
    assert_eq!(engine.ka_grace_percent, cfg.session.ka_grace_percent);
    assert_eq!(engine.connect_timeout, cfg.session.connect_timeout);
}
