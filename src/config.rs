//! Server configuration.
//!
//! [`ServerConfig`] is immutable once built: every option is resolved and
//! validated eagerly at construction, so the hot path only ever reads plain
//! fields. `ELANE_MAX_BODY_LENGTH` (decimal or `0x`-prefixed hexadecimal)
//! overrides the body-size ceiling at startup.

use std::env;
use std::fmt;

/// Default inbound body ceiling in bytes.
pub const DEFAULT_MAX_BODY_LENGTH: usize = 1_153_434_002;

/// Invalid server configuration detected at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerConfigError {
    /// TLS requires both a certificate and a private key.
    IncompleteTls,
    /// The body ceiling must be non-zero.
    ZeroMaxBodyLength,
}

impl fmt::Display for ServerConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompleteTls => {
                write!(f, "tls configuration requires both cert_file and key_file")
            }
            Self::ZeroMaxBodyLength => write!(f, "max_body_length must be greater than zero"),
        }
    }
}

impl std::error::Error for ServerConfigError {}

/// TLS material handed through to the engine, untouched by this layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub passphrase: Option<String>,
    pub dh_params_file: Option<String>,
    pub prefer_low_memory: bool,
}

/// Immutable, eagerly validated server options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tls: Option<TlsConfig>,
    /// Close listening sockets when the process is asked to exit.
    pub auto_close_on_exit: bool,
    /// Oversized or disallowed bodies close the connection immediately
    /// instead of draining and answering with an error status.
    pub fast_abort: bool,
    /// Resolve client addresses through the proxied remote address.
    pub trust_proxy: bool,
    /// Allow the engine to reuse its inbound chunk buffers. Handed through
    /// at [`crate::engine::Engine::configure`]; consumers that retain body
    /// bytes must copy. Buffered bodies are zero-initialized regardless.
    pub unsafe_buffers: bool,
    /// Inbound body ceiling in bytes; routes may override downwards or upwards.
    pub max_body_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tls: None,
            auto_close_on_exit: true,
            fast_abort: false,
            trust_proxy: false,
            unsafe_buffers: false,
            max_body_length: DEFAULT_MAX_BODY_LENGTH,
        }
    }
}

impl ServerConfig {
    /// Builder entry point.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
            cert_file: None,
            key_file: None,
            passphrase: None,
            dh_params_file: None,
            prefer_low_memory_ssl: false,
        }
    }

    /// Applies environment overrides on top of an already-built config.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("ELANE_MAX_BODY_LENGTH") {
            let parsed = if let Some(hex) = val.strip_prefix("0x") {
                usize::from_str_radix(hex, 16).ok()
            } else {
                val.parse().ok()
            };
            match parsed {
                Some(n) if n > 0 => self.max_body_length = n,
                _ => tracing::warn!(value = %val, "ignoring unparseable ELANE_MAX_BODY_LENGTH"),
            }
        }
        self
    }
}

/// Incremental construction for [`ServerConfig`]; `build` validates.
pub struct ServerConfigBuilder {
    config: ServerConfig,
    cert_file: Option<String>,
    key_file: Option<String>,
    passphrase: Option<String>,
    dh_params_file: Option<String>,
    prefer_low_memory_ssl: bool,
}

impl ServerConfigBuilder {
    #[must_use]
    pub fn cert_file(mut self, path: impl Into<String>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn key_file(mut self, path: impl Into<String>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn passphrase(mut self, value: impl Into<String>) -> Self {
        self.passphrase = Some(value.into());
        self
    }

    #[must_use]
    pub fn dh_params_file(mut self, path: impl Into<String>) -> Self {
        self.dh_params_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn prefer_low_memory_ssl(mut self, on: bool) -> Self {
        self.prefer_low_memory_ssl = on;
        self
    }

    #[must_use]
    pub fn auto_close_on_exit(mut self, on: bool) -> Self {
        self.config.auto_close_on_exit = on;
        self
    }

    #[must_use]
    pub fn fast_abort(mut self, on: bool) -> Self {
        self.config.fast_abort = on;
        self
    }

    #[must_use]
    pub fn trust_proxy(mut self, on: bool) -> Self {
        self.config.trust_proxy = on;
        self
    }

    #[must_use]
    pub fn unsafe_buffers(mut self, on: bool) -> Self {
        self.config.unsafe_buffers = on;
        self
    }

    #[must_use]
    pub fn max_body_length(mut self, bytes: usize) -> Self {
        self.config.max_body_length = bytes;
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(mut self) -> Result<ServerConfig, ServerConfigError> {
        match (self.cert_file.take(), self.key_file.take()) {
            (None, None) => {}
            (Some(cert_file), Some(key_file)) => {
                self.config.tls = Some(TlsConfig {
                    cert_file,
                    key_file,
                    passphrase: self.passphrase.take(),
                    dh_params_file: self.dh_params_file.take(),
                    prefer_low_memory: self.prefer_low_memory_ssl,
                });
            }
            _ => return Err(ServerConfigError::IncompleteTls),
        }
        if self.config.max_body_length == 0 {
            return Err(ServerConfigError::ZeroMaxBodyLength);
        }
        Ok(self.config)
    }
}
