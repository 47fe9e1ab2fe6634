//! Layered configuration loading. These tests touch process environment variables and run
//! serially.

use chainmux_core::{
    config::{AppConfig, ConfigValidationError, HubBackend},
    delegator::DelegatorFactory,
    upstream::MultiplexerBuilder,
};
use serial_test::serial;
use std::{env, fs, path::PathBuf};

const SAMPLE: &str = r#"
[endpoints.eth-main-1]
chain = { brand = "eth", network = "mainnet" }
url = "https://eth-1.example.com"
weight = 150
skip_methods = ["debug_traceTransaction"]

[endpoints.eth-main-2]
chain = { brand = "eth", network = "mainnet" }
url = "https://eth-2.example.com"
streaming_url = "wss://eth-2.example.com"
fetch_interval = 3

[stores.shared]
url = "memory://"

[hub]
backend = "pubsub"
store = "shared"

[sync]
failure_interval_seconds = 2

[cache.result]
store = "shared"
methods = [
    { method = "eth_chainId", ttl_seconds = 300 },
    { method = "net_version", ttl_seconds = 60 },
]

[rate_limit]
store = "shared"
limit_per_minute = 600
"#;

struct TempConfig {
    path: PathBuf,
}

impl TempConfig {
    fn write(name: &str, contents: &str) -> Self {
        let path = env::temp_dir().join(format!("chainmux-{name}-{}.toml", std::process::id()));
        fs::write(&path, contents).unwrap();
        Self { path }
    }
}

impl Drop for TempConfig {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn clear_env() {
    for key in ["CHAINMUX_CONFIG", "CHAINMUX__HUB__PREFIX", "CHAINMUX__LOGGING__LEVEL"] {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_load_reads_file_named_by_env() {
    clear_env();
    let file = TempConfig::write("load", SAMPLE);
    env::set_var("CHAINMUX_CONFIG", &file.path);

    let config = AppConfig::load().unwrap();
    config.validate().unwrap();

    assert_eq!(config.endpoints.len(), 2);
    let first = &config.endpoints["eth-main-1"];
    assert_eq!(first.chain.brand, "eth");
    assert_eq!(first.effective_weight(), 150);
    assert_eq!(first.skip_methods, ["debug_traceTransaction"]);
    let second = &config.endpoints["eth-main-2"];
    assert_eq!(second.streaming_url.as_deref(), Some("wss://eth-2.example.com"));
    assert_eq!(second.fetch_interval().as_secs(), 3);

    assert_eq!(config.hub.backend, HubBackend::Pubsub);
    assert_eq!(config.hub.store.as_deref(), Some("shared"));
    assert_eq!(config.hub.prefix, "chainmux");
    assert_eq!(config.sync.failure_interval_seconds, 2);
    assert_eq!(config.sync.push_reconnect_delay_seconds, 3);
    let ttls = config.cache.result.as_ref().unwrap().method_ttls();
    assert_eq!(ttls["net_version"].as_secs(), 60);
    assert!(config.cache.presence.is_none());
    assert_eq!(config.rate_limit.as_ref().unwrap().limit_per_minute, 600);
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.server.bind_port, 3030);

    clear_env();
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = TempConfig::write("override", SAMPLE);
    env::set_var("CHAINMUX__HUB__PREFIX", "staging");
    env::set_var("CHAINMUX__LOGGING__LEVEL", "debug");

    let config = AppConfig::from_file(&file.path).unwrap();
    assert_eq!(config.hub.prefix, "staging");
    assert_eq!(config.hub.backend, HubBackend::Pubsub);
    assert_eq!(config.logging.level, "debug");

    clear_env();
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    clear_env();
    env::set_var("CHAINMUX_CONFIG", env::temp_dir().join("chainmux-does-not-exist.toml"));

    let config = AppConfig::load().unwrap();
    assert!(config.endpoints.is_empty());
    assert_eq!(config.hub.backend, HubBackend::Memory);
    config.validate().unwrap();

    clear_env();
}

#[test]
#[serial]
fn test_validation_rejects_dangling_references() {
    clear_env();
    let file = TempConfig::write("dangling", &SAMPLE.replace("[stores.shared]", "[stores.other]"));
    let config = AppConfig::from_file(&file.path).unwrap();
    assert_eq!(
        config.validate(),
        Err(ConfigValidationError::UnknownStore { component: "hub", store: "shared".to_string() })
    );

    let file = TempConfig::write("bad-url", &SAMPLE.replace("https://eth-1", "ftp://eth-1"));
    let config = AppConfig::from_file(&file.path).unwrap();
    assert!(matches!(config.validate(), Err(ConfigValidationError::InvalidUrl(name, _)) if name == "eth-main-1"));
}

#[tokio::test]
#[serial]
async fn test_camel_case_methods_survive_file_loading() {
    clear_env();
    let file = TempConfig::write("camel", SAMPLE);
    let config = AppConfig::from_file(&file.path).unwrap();

    let ttls = config.cache.result.as_ref().unwrap().method_ttls();
    assert_eq!(ttls["eth_chainId"].as_secs(), 300);
    assert!(!ttls.contains_key("eth_chainid"));

    let registry = MultiplexerBuilder::from_config(&config, DelegatorFactory::with_defaults())
        .await
        .unwrap()
        .build();
    let cache = registry.result_cache().unwrap();
    assert!(cache.is_cacheable("eth_chainId"));
    assert!(cache.is_cacheable("net_version"));
    assert!(!cache.is_cacheable("eth_blockNumber"));
}
