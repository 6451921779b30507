//! Bridge configuration from the command line and environment.
//!
//! Precedence: command-line flags, then `CUEBRIDGE_*` environment variables,
//! then defaults.

use std::num::ParseIntError;
use std::path::PathBuf;

use crate::bridge::transport::TransportKind;

pub const DEFAULT_PORT: u16 = 4557;
pub const DEFAULT_CLIENT_PORT: u16 = 4558;
pub const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

pub const ENV_PORT: &str = "CUEBRIDGE_PORT";
pub const ENV_CLIENT_PORT: &str = "CUEBRIDGE_CLIENT_PORT";
pub const ENV_TRANSPORT: &str = "CUEBRIDGE_TRANSPORT";

pub const USAGE: &str = "\
Usage: cuebridge-server [-t|-u] [options] [port] [client_port]

Options:
  -t, --tcp               Use the stream (TCP) transport
  -u, --udp               Use the datagram (UDP) transport [default]
      --port <port>       Port to listen on [default: 4557]
      --client-port <p>   GUI port to send events to [default: 4558]
      --client-host <h>   GUI host [default: 127.0.0.1]
      --bind <host>       Address to listen on [default: 0.0.0.0]
      --store <dir>       Directory for saved buffers
  -h, --help              Show this help

Environment:
  CUEBRIDGE_PORT, CUEBRIDGE_CLIENT_PORT, CUEBRIDGE_TRANSPORT (udp|tcp)
  CUEBRIDGE_LOG (debug|info|warn|error), RUST_LOG, LOG_FORMAT=json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `-h`/`--help` was given.
    #[error("help requested")]
    Help,

    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("invalid port '{value}' for {origin}")]
    InvalidPort {
        origin: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("invalid transport in {origin}: {message}")]
    InvalidTransport { origin: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub transport: TransportKind,
    /// Port the bridge listens on for GUI commands.
    pub port: u16,
    /// Port the GUI listens on for events.
    pub client_port: u16,
    pub client_host: String,
    pub bind_host: String,
    /// Where the loopback engine persists buffers; in memory when unset.
    pub store: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            port: DEFAULT_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            client_host: DEFAULT_CLIENT_HOST.to_string(),
            bind_host: DEFAULT_BIND_HOST.to_string(),
            store: None,
        }
    }
}

impl BridgeConfig {
    /// Build from `argv` (including the program name) and the process environment.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        Self::from_sources(args, |key| std::env::var(key).ok())
    }

    pub fn from_sources(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(&env)?;
        config.apply_args(args)?;
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = env(ENV_PORT) {
            self.port = parse_port(ENV_PORT, &value)?;
        }
        if let Some(value) = env(ENV_CLIENT_PORT) {
            self.client_port = parse_port(ENV_CLIENT_PORT, &value)?;
        }
        if let Some(value) = env(ENV_TRANSPORT) {
            self.transport = value
                .parse()
                .map_err(|message| ConfigError::InvalidTransport {
                    origin: ENV_TRANSPORT.to_string(),
                    message,
                })?;
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        let mut positional = Vec::new();

        let mut i = 1; // skip argv[0]
        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "-t" | "--tcp" => self.transport = TransportKind::Stream,
                "-u" | "--udp" => self.transport = TransportKind::Datagram,
                "--port" => {
                    i += 1;
                    self.port = parse_port(arg, value(args, i, arg)?)?;
                }
                "--client-port" => {
                    i += 1;
                    self.client_port = parse_port(arg, value(args, i, arg)?)?;
                }
                "--client-host" => {
                    i += 1;
                    self.client_host = value(args, i, arg)?.to_string();
                }
                "--bind" => {
                    i += 1;
                    self.bind_host = value(args, i, arg)?.to_string();
                }
                "--store" => {
                    i += 1;
                    self.store = Some(PathBuf::from(value(args, i, arg)?));
                }
                "--help" | "-h" => return Err(ConfigError::Help),
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(ConfigError::UnknownFlag(flag.to_string()));
                }
                other => positional.push(other),
            }
            i += 1;
        }

        match positional.as_slice() {
            [] => {}
            [port] => self.port = parse_port("port", port)?,
            [port, client_port] => {
                self.port = parse_port("port", port)?;
                self.client_port = parse_port("client_port", client_port)?;
            }
            [_, _, extra, ..] => return Err(ConfigError::UnexpectedArgument(extra.to_string())),
        }
        Ok(())
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ConfigError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parse_port(origin: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidPort {
            origin: origin.to_string(),
            value: value.to_string(),
            source,
        })
}
