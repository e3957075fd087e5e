//! Configuration loading from files and the environment

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use tsrouter::config::Config;
use tsrouter::types::LoadBalanceMethod;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_load_full_config_from_file() {
    let file = write_config(
        r#"
            [router]
            render_timeout = 15000
            probe_interval = 120000

            [[groups]]
            name = "graphite-a"
            protocol = "msgpack"
            servers = ["http://10.0.0.1:8080", "http://10.0.0.2:8080"]
            max_batch_size = 100

            [[groups]]
            name = "prom"
            protocol = "prometheus"
            servers = ["http://10.0.1.1:9090"]
            lb_method = "broadcast"

            [groups.options]
            step = 30
        "#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.groups.len(), 2);
    assert_eq!(config.router.render_timeout, Duration::from_secs(15));
    assert_eq!(config.router.probe_interval, Duration::from_secs(120));

    let graphite = &config.groups[0];
    assert_eq!(graphite.servers.len(), 2);
    assert_eq!(graphite.max_batch_size, 100);
    assert_eq!(graphite.lb_method, LoadBalanceMethod::RoundRobin);

    let prom = &config.groups[1];
    assert_eq!(prom.lb_method, LoadBalanceMethod::Broadcast);
    assert_eq!(
        prom.options.get("step").and_then(|v| v.as_integer()),
        Some(30)
    );
}

#[test]
fn test_load_rejects_invalid_file() {
    let file = write_config("this is not toml [[");
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_load_rejects_missing_file() {
    assert!(Config::load(std::path::Path::new("/nonexistent/tsrouter.toml")).is_err());
}

