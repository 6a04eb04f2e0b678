/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_RETENTION: usize = 7;
pub const DEFAULT_HTTP_PORTS: [u16; 3] = [80, 8080, 8000];
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 << 20;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("http ports is empty")]
    PortsEmpty,
    #[error("transaction-timeout must be positive")]
    TransactionTimeoutInvalid,
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_level: String,
    // empty for stderr only
    pub log_file: String,
    pub log_retention: usize,
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.into(),
            log_file: "".into(),
            log_retention: DEFAULT_LOG_RETENTION,
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            return Ok(Self::default());
        }
        let mut cfg: Self = serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        cfg.http.normalize();
        cfg.http.validate()?;
        Ok(cfg)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpConfig {
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    // header allow-list, ignored when send-all-headers is set
    pub send_headers: Vec<String>,
    pub send_all_headers: bool,
    pub split_cookie: bool,
    pub real_ip_header: String,
    pub hide_keywords: Vec<String>,
    pub redact_authorization: bool,
    pub redact_headers: Vec<String>,
    pub include_body_for: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub transaction_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_HTTP_PORTS.to_vec(),
            send_request: false,
            send_response: false,
            send_headers: vec![],
            send_all_headers: false,
            split_cookie: false,
            real_ip_header: "".into(),
            hide_keywords: vec![],
            redact_authorization: false,
            redact_headers: vec![],
            include_body_for: vec![],
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl HttpConfig {
    // header names and keywords are compared in lower case
    pub fn normalize(&mut self) {
        fn lower(v: &mut Vec<String>) {
            v.iter_mut().for_each(|s| *s = s.trim().to_ascii_lowercase());
            v.retain(|s| !s.is_empty());
        }
        lower(&mut self.send_headers);
        lower(&mut self.hide_keywords);
        lower(&mut self.redact_headers);
        self.real_ip_header = self.real_ip_header.trim().to_ascii_lowercase();
        self.ports.sort_unstable();
        self.ports.dedup();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::PortsEmpty);
        }
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::TransactionTimeoutInvalid);
        }
        Ok(())
    }

    pub fn send_headers(&self) -> bool {
        self.send_all_headers || !self.send_headers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::load("").unwrap(), Config::default());
        assert_eq!(Config::load("\n").unwrap(), Config::default());
    }

    #[test]
    fn load_http_section() {
        let yaml = r#"
log-level: debug
http:
  ports: [8080, 80, 8080]
  send-request: true
  send-headers: [User-Agent, " Cookie"]
  split-cookie: true
  real-ip-header: X-Forwarded-For
  hide-keywords: [Password, token]
  redact-authorization: true
  include-body-for: [text/html]
  transaction-timeout: 15s
"#;
        let cfg = Config::load(yaml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.log_retention, DEFAULT_LOG_RETENTION);
        let http = &cfg.http;
        assert_eq!(http.ports, vec![80, 8080]);
        assert!(http.send_request);
        assert!(!http.send_response);
        assert_eq!(http.send_headers, vec!["user-agent", "cookie"]);
        assert!(http.send_headers());
        assert_eq!(http.real_ip_header, "x-forwarded-for");
        assert_eq!(http.hide_keywords, vec!["password", "token"]);
        assert_eq!(http.transaction_timeout, Duration::from_secs(15));
        assert_eq!(http.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn invalid_configs() {
        assert_eq!(
            Config::load("http:\n  ports: []\n"),
            Err(ConfigError::PortsEmpty)
        );
        assert_eq!(
            Config::load("http:\n  transaction-timeout: 0s\n"),
            Err(ConfigError::TransactionTimeoutInvalid)
        );
        assert!(matches!(
            Config::load("http: [1, 2"),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http:\n  ports: [3128]").unwrap();
        let cfg = Config::load_from_file(file.path()).unwrap();
        assert_eq!(cfg.http.ports, vec![3128]);

        assert!(Config::load_from_file("/nonexistent/http-analyzer.yaml").is_err());
    }
}
