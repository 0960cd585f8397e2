//! Process configuration.
//!
//! A [`Config`] is read from a TOML file. Every field has a default so a
//! file only needs the settings of the role it runs; [`Config::check_lb`]
//! and [`Config::check_proxy`] reject what a role cannot run without.

use std::{collections::BTreeMap, fs, io, net::SocketAddr, path::Path};

use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;

use crate::{
    backend::{self, BackendOptions},
    buffer_pool::BufferPool,
    router::RouterOptions,
    server::{lb::LbOptions, proxy::ProxyOptions},
    session::{DEFAULT_MAX_PIPELINE, SessionMode, SessionOptions},
    transport::{DEFAULT_MAX_FRAME_LENGTH, FlushPolicy, TransportOptions},
};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A setting the selected role needs is missing.
    #[error("missing setting: {0}")]
    Missing(&'static str),
    /// A setting has a value the role cannot use.
    #[error("invalid setting {name}: {reason}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Settings of a load balancer or proxy process.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Product whose registry subtree is used.
    pub product: String,
    /// Coordination service address.
    pub zk: String,
    /// Coordination session timeout in seconds.
    pub zk_session_timeout: u64,
    /// Service served by a load balancer.
    pub service: String,
    /// Frontend host of a load balancer.
    pub front_host: String,
    /// Frontend port of a load balancer.
    pub front_port: u16,
    /// Frontend unix socket of a load balancer, used instead of host and
    /// port when set.
    pub front_sock: String,
    /// Address workers connect to.
    pub back_address: String,
    /// Address a proxy listens on.
    pub proxy_address: String,
    /// Log per-request detail.
    pub verbose: bool,
    /// Serve from the static `endpoints` table instead of a coordination
    /// service.
    pub stand_alone: bool,
    /// Static registry content: service name to frontend addresses.
    pub endpoints: BTreeMap<String, Vec<String>>,
    /// Recorded in the registry entry of a load balancer.
    pub deploy_path: String,
    /// Recorded in the registry entry of a load balancer.
    pub code_url_version: String,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence tolerated, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Age at which a pending request fails, in milliseconds.
    pub request_expiry_ms: u64,
    /// Concurrent requests per pipelined session.
    pub max_pipeline: usize,
    /// Largest frame accepted, in bytes.
    pub max_frame_length: usize,
    /// Writes buffered before a flush.
    pub flush_max_buffered: usize,
    /// Longest a write stays buffered, in microseconds.
    pub flush_interval_us: u64,
    /// Address of the Prometheus exporter, if any.
    pub metrics_address: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        let flush = FlushPolicy::default();
        Self {
            product: String::new(),
            zk: String::new(),
            zk_session_timeout: 15,
            service: String::new(),
            front_host: String::new(),
            front_port: 0,
            front_sock: String::new(),
            back_address: String::new(),
            proxy_address: String::new(),
            verbose: false,
            stand_alone: false,
            endpoints: BTreeMap::new(),
            deploy_path: String::new(),
            code_url_version: String::new(),
            heartbeat_interval_ms: millis(backend::DEFAULT_HEARTBEAT_INTERVAL),
            heartbeat_timeout_secs: backend::DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
            request_expiry_ms: millis(backend::DEFAULT_REQUEST_EXPIRY),
            max_pipeline: DEFAULT_MAX_PIPELINE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            flush_max_buffered: flush.max_buffered,
            flush_interval_us: u64::try_from(flush.max_interval.as_micros()).unwrap_or(u64::MAX),
            metrics_address: None,
        }
    }
}

fn millis(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(u64::MAX) }

impl Config {
    /// Read and parse the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input.
    pub fn parse(text: &str) -> Result<Self, ConfigError> { Ok(toml::from_str(text)?) }

    /// Address a load balancer serves clients on: the unix socket when set,
    /// otherwise `front_host:front_port`.
    #[must_use]
    pub fn frontend_addr(&self) -> String {
        if self.front_sock.is_empty() {
            format!("{}:{}", self.front_host, self.front_port)
        } else {
            self.front_sock.clone()
        }
    }

    /// Validate the settings a load balancer needs.
    ///
    /// # Errors
    ///
    /// Returns the first missing or invalid setting.
    pub fn check_lb(&self) -> Result<(), ConfigError> {
        self.check_common()?;
        require(&self.service, "service")?;
        require(&self.back_address, "back_address")?;
        if self.front_sock.is_empty() {
            require(&self.front_host, "front_host")?;
            if self.front_port == 0 {
                return Err(ConfigError::Missing("front_port"));
            }
        }
        Ok(())
    }

    /// Validate the settings a proxy needs.
    ///
    /// # Errors
    ///
    /// Returns the first missing or invalid setting.
    pub fn check_proxy(&self) -> Result<(), ConfigError> {
        self.check_common()?;
        require(&self.proxy_address, "proxy_address")?;
        if self.stand_alone && self.endpoints.is_empty() {
            return Err(ConfigError::Missing("endpoints"));
        }
        Ok(())
    }

    fn check_common(&self) -> Result<(), ConfigError> {
        require(&self.product, "product")?;
        if !self.stand_alone {
            require(&self.zk, "zk")?;
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms", "must be positive"));
        }
        if Duration::from_secs(self.heartbeat_timeout_secs) <= self.heartbeat_interval() {
            return Err(invalid(
                "heartbeat_timeout_secs",
                "must exceed the heartbeat interval",
            ));
        }
        if self.max_pipeline == 0 {
            return Err(invalid("max_pipeline", "must be positive"));
        }
        if self.max_frame_length == 0 {
            return Err(invalid("max_frame_length", "must be positive"));
        }
        Ok(())
    }

    fn heartbeat_interval(&self) -> Duration { Duration::from_millis(self.heartbeat_interval_ms) }

    /// Framing limits and flush policy.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            max_frame_length: self.max_frame_length,
            flush: FlushPolicy {
                max_buffered: self.flush_max_buffered,
                max_interval: Duration::from_micros(self.flush_interval_us),
            },
        }
    }

    /// Options of each backend connection.
    #[must_use]
    pub fn backend_options(&self, buffer_pool: &BufferPool) -> BackendOptions {
        BackendOptions {
            heartbeat_interval: self.heartbeat_interval(),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            request_expiry: Duration::from_millis(self.request_expiry_ms),
            transport: self.transport_options(),
            buffer_pool: buffer_pool.clone(),
            verbose: self.verbose,
            ..BackendOptions::default()
        }
    }

    /// Options of each client session in `mode`.
    #[must_use]
    pub fn session_options(&self, mode: SessionMode, buffer_pool: &BufferPool) -> SessionOptions {
        SessionOptions {
            transport: self.transport_options(),
            buffer_pool: buffer_pool.clone(),
            max_pipeline: self.max_pipeline,
            verbose: self.verbose,
            ..SessionOptions::new(mode)
        }
    }

    /// Options of a load balancer.
    #[must_use]
    pub fn lb_options(&self) -> LbOptions {
        let pool = BufferPool::new();
        LbOptions {
            backend: self.backend_options(&pool),
            session: self.session_options(SessionMode::Pipelined, &pool),
            deploy_path: self.deploy_path.clone(),
            code_url_version: self.code_url_version.clone(),
            ..LbOptions::new(
                self.service.clone(),
                self.frontend_addr(),
                self.back_address.clone(),
            )
        }
    }

    /// Options of a proxy.
    #[must_use]
    pub fn proxy_options(&self) -> ProxyOptions {
        let pool = BufferPool::new();
        ProxyOptions {
            router: RouterOptions {
                backend: self.backend_options(&pool),
                verbose: self.verbose,
                ..RouterOptions::default()
            },
            session: self.session_options(SessionMode::Ordered, &pool),
            ..ProxyOptions::new(self.proxy_address.clone())
        }
    }
}

fn require(value: &str, name: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(name))
    } else {
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn lb_config() -> Config {
        Config::parse(
            r#"
            product = "shop"
            zk = "127.0.0.1:2181"
            service = "user"
            front_host = "10.0.0.5"
            front_port = 5555
            back_address = "127.0.0.1:5556"
            "#,
        )
        .expect("valid config")
    }

    #[rstest]
    fn defaults_fill_unset_fields(lb_config: Config) {
        assert_eq!(lb_config.max_pipeline, DEFAULT_MAX_PIPELINE);
        assert_eq!(lb_config.heartbeat_timeout_secs, 6);
        assert_eq!(lb_config.request_expiry_ms, 5000);
        assert!(lb_config.endpoints.is_empty());
        assert!(lb_config.check_lb().is_ok());
    }

    #[rstest]
    fn frontend_prefers_the_unix_socket(mut lb_config: Config) {
        assert_eq!(lb_config.frontend_addr(), "10.0.0.5:5555");
        lb_config.front_sock = "/tmp/user.sock".into();
        assert_eq!(lb_config.frontend_addr(), "/tmp/user.sock");
    }

    #[rstest]
    #[case::product(|c: &mut Config| c.product.clear(), "product")]
    #[case::service(|c: &mut Config| c.service.clear(), "service")]
    #[case::backend(|c: &mut Config| c.back_address.clear(), "back_address")]
    #[case::port(|c: &mut Config| c.front_port = 0, "front_port")]
    fn lb_rejects_missing_settings(
        mut lb_config: Config,
        #[case] edit: fn(&mut Config),
        #[case] name: &str,
    ) {
        edit(&mut lb_config);
        let err = lb_config.check_lb().expect_err("must be rejected");
        assert!(err.to_string().contains(name), "{err}");
    }

    #[rstest]
    fn heartbeat_timeout_must_exceed_interval(mut lb_config: Config) {
        lb_config.heartbeat_interval_ms = 7000;
        assert!(matches!(
            lb_config.check_lb(),
            Err(ConfigError::Invalid {
                name: "heartbeat_timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn stand_alone_proxy_needs_endpoints_not_zk() {
        let mut config = Config::parse(
            r#"
            product = "shop"
            proxy_address = "127.0.0.1:5550"
            stand_alone = true
            "#,
        )
        .unwrap();
        assert!(matches!(config.check_proxy(), Err(ConfigError::Missing("endpoints"))));
        config
            .endpoints
            .insert("user".into(), vec!["127.0.0.1:5555".into()]);
        assert!(config.check_proxy().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::parse("prodcut = \"shop\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[rstest]
    fn options_carry_tunables(mut lb_config: Config) {
        lb_config.request_expiry_ms = 1500;
        lb_config.max_pipeline = 8;
        let lb = lb_config.lb_options();
        assert_eq!(lb.backend.request_expiry, Duration::from_millis(1500));
        assert_eq!(lb.session.max_pipeline, 8);
        assert_eq!(lb.session.mode, SessionMode::Pipelined);
        assert_eq!(lb.frontend, "10.0.0.5:5555");
    }
}
