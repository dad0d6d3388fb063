// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use uuid::Uuid;

use crate::compression::{CompressionProvider, GzipCompression};
use crate::envelope::{EnvelopeOptions, VectorFormat, DEFAULT_MAX_DEPTH};
use crate::network::TransportOptions;
use crate::transfer::TransferOptions;

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// When set, routes match regardless of the host and port a request was addressed to.
    pub bind_any_host: bool,
    /// Socket buffer size, also the chunk size of the transport send buffer.
    pub buffer_size: usize,
    pub idle_timeout_ms: u64,
    pub max_connection: usize,
    pub max_package_size: usize,
    pub max_header_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 7070,
            bind_any_host: true,
            buffer_size: 64 * 1024,
            idle_timeout_ms: 30_000,
            max_connection: 1024,
            max_package_size: 256 * 1024 * 1024,
            max_header_size: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            buffer_size: self.buffer_size,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_package_size: self.max_package_size,
            max_header_size: self.max_header_size,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub validate_checksum: bool,
    pub vector_format: VectorFormat,
    /// deepest child level a received envelope may carry
    pub max_depth: usize,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        EnvelopeConfig {
            validate_checksum: true,
            vector_format: VectorFormat::Csv,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EnvelopeConfig {
    pub fn options(&self) -> EnvelopeOptions {
        EnvelopeOptions {
            validate_checksum: self.validate_checksum,
            vector_format: self.vector_format,
            max_depth: self.max_depth,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// gzip level, 0 to 9
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: false,
            level: 6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    /// Identifies this process in outgoing batches; a random id is used when absent.
    pub client_id: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            client_id: None,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub envelope: EnvelopeConfig,
    pub compression: CompressionConfig,
    pub transfer: TransferConfig,
}

impl ServerConfig {
    /// Loads the toml file at `path`, then applies `VECWIRE_<SECTION>__<KEY>` overrides
    /// from the environment.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("VECWIRE").separator("__"))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;

        Ok(server_config)
    }

    pub fn compression_provider(&self) -> Option<Arc<dyn CompressionProvider>> {
        if !self.compression.enabled {
            return None;
        }
        Some(Arc::new(
            GzipCompression::new(self.compression.level)
                .with_max_output(self.network.max_package_size),
        ))
    }

    /// Options for outgoing transfer clients, forwarding included.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            transport: self.network.transport_options(),
            connect_timeout: Duration::from_millis(self.transfer.connect_timeout_ms),
            client_id: self
                .transfer
                .client_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            envelope: self.envelope.options(),
            compression: self.compression_provider(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::Builder;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[network]\nport = 9191\nidle_timeout_ms = 500\n\n[envelope]\nvector_format = \"base64\"\nmax_depth = 8"
        )
        .unwrap();

        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.port, 9191);
        assert_eq!(config.network.idle_timeout_ms, 500);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.buffer_size, 64 * 1024);
        assert_eq!(config.envelope.vector_format, VectorFormat::Base64);
        assert!(config.envelope.validate_checksum);
        assert_eq!(config.envelope.options().max_depth, 8);
        assert_eq!(EnvelopeConfig::default().max_depth, DEFAULT_MAX_DEPTH);
        assert!(!config.compression.enabled);
    }

    #[test]
    fn missing_file_is_config_error() {
        let result = ServerConfig::set_up_config("/definitely/not/here/vecwire.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }

    #[test]
    fn transport_options_follow_network_section() {
        let network = NetworkConfig {
            idle_timeout_ms: 1_500,
            buffer_size: 1024,
            ..Default::default()
        };
        let options = network.transport_options();
        assert_eq!(options.idle_timeout, Duration::from_millis(1_500));
        assert_eq!(options.buffer_size, 1024);
        assert_eq!(network.listen_address(), "127.0.0.1:7070");
    }

    #[test]
    fn transfer_options_carry_the_other_sections() {
        let mut config = ServerConfig::default();
        assert!(config.compression_provider().is_none());

        config.compression.enabled = true;
        config.transfer.client_id = Some("node-a".to_string());
        config.transfer.connect_timeout_ms = 250;
        config.envelope.validate_checksum = false;

        let options = config.transfer_options();
        assert_eq!(options.client_id, "node-a");
        assert_eq!(options.connect_timeout, Duration::from_millis(250));
        assert!(!options.envelope.validate_checksum);
        assert!(options.compression.is_some());
    }
}
