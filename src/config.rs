use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Result;
use clap::ArgAction;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_serial::DataBits;
use tokio_serial::Parity;
use tokio_serial::StopBits;

use crate::modbus_shim::TransportConfig;
use crate::modbus_shim::DEFAULT_BAUD_RATE;
use crate::modbus_shim::DEFAULT_TCP_PORT;
use crate::modbus_shim::DEFAULT_TIMEOUT;
use crate::orchestrator::Schedule;
use crate::relay_types::RelayId;
use crate::relay_types::SlaveId;

const DEFAULT_TIMEOUT_MS: u64 = DEFAULT_TIMEOUT.as_millis() as u64;

/// Switches Modbus relays on while their calendar reports an event.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Modbus unit id of the relay board
    #[arg(long, env = "MODBUS_SLAVE")]
    slave: u8,

    /// Relay and the URL telling whether it has an event, e.g. 1=https://host/room-a.
    /// Several pairs in one value are separated by whitespace
    #[arg(long = "relay", env = "RELAYS", value_delimiter = ' ', value_parser = parse_relay)]
    relays: Vec<(RelayId, String)>,

    /// Seconds to wait between two reconciliation cycles
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 30)]
    poll_interval_secs: u64,

    /// Seconds to wait before retrying a failed connection
    #[arg(long, env = "BACKOFF_SECS", default_value_t = 5)]
    backoff_secs: u64,

    /// Attempts per relay and cycle
    #[arg(long, env = "RELAY_ATTEMPTS", default_value_t = 3)]
    attempts: u32,

    /// Milliseconds between two attempts on the same relay
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 100)]
    retry_delay_ms: u64,

    /// Switch every relay on, then off, and exit
    #[arg(long)]
    exercise: bool,

    /// Increase logging verbosity
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Silence all output
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    link: Link,
}

#[derive(Debug, Subcommand)]
enum Link {
    /// Modbus TCP
    Tcp {
        #[arg(long, env = "MODBUS_HOST")]
        host: String,

        #[arg(long, env = "MODBUS_PORT", default_value_t = DEFAULT_TCP_PORT)]
        port: u16,

        #[arg(long, env = "MODBUS_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
        timeout_ms: u64,
    },
    /// Modbus RTU over a serial line
    Serial {
        /// Serial device, e.g. /dev/ttyUSB0 or COM3
        #[arg(long, env = "MODBUS_SERIAL_PORT")]
        port: String,

        #[arg(long, env = "MODBUS_BAUD_RATE", default_value_t = DEFAULT_BAUD_RATE)]
        baud_rate: u32,

        #[arg(long, env = "MODBUS_STOP_BITS", default_value_t = 1)]
        stop_bits: u8,

        #[arg(long, env = "MODBUS_PARITY", value_enum, default_value = "none")]
        parity: ParityArg,

        #[arg(long, env = "MODBUS_BYTE_SIZE", default_value_t = 8)]
        byte_size: u8,

        #[arg(long, env = "MODBUS_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
        timeout_ms: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ParityArg {
    None,
    Even,
    Odd,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub transport: TransportConfig,
    pub slave: SlaveId,
    pub relays: BTreeMap<RelayId, String>,
    pub schedule: Schedule,
    pub exercise: bool,
}

impl Args {
    /// Validates the arguments. Relays without `--relay` are also looked up as
    /// `RELAY_<N>_STATUS_URL` through `env`.
    pub fn into_config<F>(self, env: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut relays = BTreeMap::new();
        for (relay, url) in self.relays {
            if relays.insert(relay, url).is_some() {
                bail!("'{}' is configured more than once", relay);
            }
        }
        for relay in RelayId::ALL {
            if relays.contains_key(&relay) {
                continue;
            }
            let key = format!("RELAY_{}_STATUS_URL", relay.number());
            if let Some(url) = env(&key).filter(|url| !url.trim().is_empty()) {
                relays.insert(relay, url.trim().to_string());
            }
        }
        ensure!(
            !relays.is_empty(),
            "No relay configured, use --relay N=URL or RELAY_N_STATUS_URL"
        );
        ensure!(self.attempts > 0, "--attempts must be at least 1");

        Ok(Config {
            transport: self.link.into_transport()?,
            slave: SlaveId(self.slave),
            relays,
            schedule: Schedule {
                poll_interval: Duration::from_secs(self.poll_interval_secs),
                backoff: Duration::from_secs(self.backoff_secs),
                attempts: self.attempts,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
            },
            exercise: self.exercise,
        })
    }
}

impl Link {
    fn into_transport(self) -> Result<TransportConfig> {
        let transport = match self {
            Link::Tcp {
                host,
                port,
                timeout_ms,
            } => {
                ensure!(!host.trim().is_empty(), "--host must not be empty");
                TransportConfig::Network {
                    host,
                    port,
                    timeout: Duration::from_millis(timeout_ms),
                }
            }
            Link::Serial {
                port,
                baud_rate,
                stop_bits,
                parity,
                byte_size,
                timeout_ms,
            } => TransportConfig::Serial {
                port,
                baud_rate,
                stop_bits: match stop_bits {
                    1 => StopBits::One,
                    2 => StopBits::Two,
                    other => bail!("Unsupported stop bits '{}', expected 1 or 2", other),
                },
                parity: match parity {
                    ParityArg::None => Parity::None,
                    ParityArg::Even => Parity::Even,
                    ParityArg::Odd => Parity::Odd,
                },
                byte_size: match byte_size {
                    5 => DataBits::Five,
                    6 => DataBits::Six,
                    7 => DataBits::Seven,
                    8 => DataBits::Eight,
                    other => bail!("Unsupported byte size '{}', expected 5 to 8", other),
                },
                timeout: Duration::from_millis(timeout_ms),
            },
        };
        Ok(transport)
    }
}

fn parse_relay(value: &str) -> Result<(RelayId, String)> {
    let (relay, url) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected N=URL but got '{}'", value))?;
    let relay = relay.parse::<RelayId>()?;
    let url = url.trim();
    ensure!(!url.is_empty(), "Missing URL for '{}'", relay);
    Ok((relay, url.to_string()))
}
