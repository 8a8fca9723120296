use crate::relay_types::SlaveId;

use log::debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::client::sync;
use tokio_modbus::client::sync::Reader;
use tokio_modbus::client::sync::Writer;
use tokio_modbus::prelude::ExceptionCode;
use tokio_modbus::prelude::Slave;
use tokio_modbus::prelude::SlaveContext;
use tokio_serial::DataBits;
use tokio_serial::Parity;
use tokio_serial::StopBits;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("Failed to connect to '{endpoint}': {source}")]
pub struct ConnectError {
    endpoint: String,
    #[source]
    source: io::Error,
}

impl ConnectError {
    pub fn new<S: Into<String>>(endpoint: S, source: io::Error) -> Self {
        Self {
            endpoint: endpoint.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Link failure during {operation}: {source}")]
    Link {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Short response to {operation}: expected {expected} coils but got {actual}")]
    ShortResponse {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Device rejected {operation}: {code}")]
    Exception {
        operation: &'static str,
        code: ExceptionCode,
    },
}

impl TransportError {
    /// The request never got a usable answer from the device.
    pub fn is_link(&self) -> bool {
        !self.is_exception()
    }

    /// The device answered with a Modbus exception.
    pub fn is_exception(&self) -> bool {
        matches!(self, TransportError::Exception { .. })
    }

    fn from_modbus<T>(
        operation: &'static str,
        result: Result<Result<T, ExceptionCode>, tokio_modbus::Error>,
    ) -> Result<T, TransportError> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(code)) => Err(TransportError::Exception { operation, code }),
            Err(tokio_modbus::Error::Transport(source)) => {
                Err(TransportError::Link { operation, source })
            }
            Err(e) => Err(TransportError::Link {
                operation,
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            }),
        }
    }
}

/// Physical link to a Modbus device.
///
/// Both link types expose the same operations; only the connection
/// parameters in [`TransportConfig`] differ. Coil addresses are zero-based
/// at this layer.
#[cfg_attr(test, mockall::automock)]
pub trait TransportClient {
    fn connect(&mut self) -> Result<(), ConnectError>;

    fn read_coils(
        &mut self,
        base_address: u16,
        count: u16,
        slave: SlaveId,
    ) -> Result<Vec<bool>, TransportError>;

    fn write_coil(&mut self, address: u16, value: bool, slave: SlaveId)
        -> Result<(), TransportError>;

    /// Must be safe to call when not connected.
    fn close(&mut self);
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportConfig {
    Serial {
        port: String,
        baud_rate: u32,
        stop_bits: StopBits,
        parity: Parity,
        byte_size: DataBits,
        timeout: Duration,
    },
    Network {
        host: String,
        port: u16,
        timeout: Duration,
    },
}

impl TransportConfig {
    #[cfg(test)]
    pub fn serial<S: Into<String>>(port: S) -> Self {
        TransportConfig::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            stop_bits: StopBits::One,
            parity: Parity::None,
            byte_size: DataBits::Eight,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn network<S: Into<String>>(host: S) -> Self {
        TransportConfig::Network {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            TransportConfig::Serial { timeout, .. } => *timeout,
            TransportConfig::Network { timeout, .. } => *timeout,
        }
    }
}

impl Display for TransportConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TransportConfig::Serial {
                port, baud_rate, ..
            } => write!(f, "rtu://{}@{}", port, baud_rate),
            TransportConfig::Network { host, port, .. } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Modbus RTU or TCP client, depending on its [`TransportConfig`].
pub struct ModbusTransport {
    config: TransportConfig,
    context: Option<sync::Context>,
}

impl ModbusTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            context: None,
        }
    }

    fn open(&self) -> io::Result<sync::Context> {
        // unit id is selected per request
        let slave = Slave(0);
        match &self.config {
            TransportConfig::Serial {
                port,
                baud_rate,
                stop_bits,
                parity,
                byte_size,
                timeout,
            } => {
                let builder = tokio_serial::new(port.as_str(), *baud_rate)
                    .stop_bits(*stop_bits)
                    .parity(*parity)
                    .data_bits(*byte_size)
                    .timeout(*timeout);
                sync::rtu::connect_slave_with_timeout(&builder, slave, Some(*timeout))
            }
            TransportConfig::Network {
                host,
                port,
                timeout,
            } => {
                let socket_addr = resolve(host, *port)?;
                sync::tcp::connect_slave_with_timeout(socket_addr, slave, Some(*timeout))
            }
        }
    }

    fn context(&mut self, slave: SlaveId) -> Result<&mut sync::Context, TransportError> {
        let context = self.context.as_mut().ok_or(TransportError::NotConnected)?;
        context.set_slave(Slave(slave.0));
        Ok(context)
    }
}

impl TransportClient for ModbusTransport {
    fn connect(&mut self) -> Result<(), ConnectError> {
        self.close();
        let context = self
            .open()
            .map_err(|e| ConnectError::new(self.config.to_string(), e))?;
        debug!("Connected to '{}'", self.config);
        self.context = Some(context);
        Ok(())
    }

    fn read_coils(
        &mut self,
        base_address: u16,
        count: u16,
        slave: SlaveId,
    ) -> Result<Vec<bool>, TransportError> {
        let result = self.context(slave)?.read_coils(base_address, count);
        let coils = TransportError::from_modbus("read coils", result)?;
        if coils.len() < usize::from(count) {
            return Err(TransportError::ShortResponse {
                operation: "read coils",
                expected: usize::from(count),
                actual: coils.len(),
            });
        }
        Ok(coils)
    }

    fn write_coil(
        &mut self,
        address: u16,
        value: bool,
        slave: SlaveId,
    ) -> Result<(), TransportError> {
        let result = self.context(slave)?.write_single_coil(address, value);
        TransportError::from_modbus("write coil", result)
    }

    fn close(&mut self) {
        // dropping the context shuts down its socket or serial port
        if self.context.take().is_some() {
            debug!("Closed connection to '{}'", self.config);
        }
    }
}

impl Drop for ModbusTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("No address found for host '{}'", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::future;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::runtime::Runtime;
    use tokio_modbus::prelude::Request;
    use tokio_modbus::prelude::Response;
    use tokio_modbus::server::tcp::accept_tcp_connection;
    use tokio_modbus::server::tcp::Server;

    const SLAVE: SlaveId = SlaveId(1);

    /// In-memory relay board answering read coils and write single coil.
    #[derive(Clone, Default)]
    struct CoilBoard {
        coils: Arc<Mutex<[bool; 8]>>,
    }

    impl tokio_modbus::server::Service for CoilBoard {
        type Request = Request<'static>;
        type Response = Response;
        type Exception = ExceptionCode;
        type Future = future::Ready<Result<Self::Response, Self::Exception>>;

        fn call(&self, req: Self::Request) -> Self::Future {
            let mut coils = self.coils.lock().unwrap();
            let res = match req {
                Request::ReadCoils(addr, cnt) => {
                    let (start, end) = (usize::from(addr), usize::from(addr) + usize::from(cnt));
                    match end <= coils.len() {
                        true => Ok(Response::ReadCoils(coils[start..end].to_vec())),
                        false => Err(ExceptionCode::IllegalDataAddress),
                    }
                }
                Request::WriteSingleCoil(addr, value) => match coils.get_mut(usize::from(addr)) {
                    Some(coil) => {
                        *coil = value;
                        Ok(Response::WriteSingleCoil(addr, value))
                    }
                    None => Err(ExceptionCode::IllegalDataAddress),
                },
                _ => Err(ExceptionCode::IllegalFunction),
            };
            future::ready(res)
        }
    }

    fn start_board() -> (Runtime, SocketAddr) {
        let runtime = Runtime::new().unwrap();
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let socket_addr = listener.local_addr().unwrap();
        let board = CoilBoard::default();
        runtime.spawn(async move {
            let server = Server::new(listener);
            let new_service =
                move |_socket_addr: SocketAddr| -> io::Result<Option<CoilBoard>> {
                    Ok(Some(board.clone()))
                };
            let on_connected = move |stream: tokio::net::TcpStream, socket_addr: SocketAddr| {
                let new_service = new_service.clone();
                async move { accept_tcp_connection(stream, socket_addr, new_service) }
            };
            let on_process_error = |err| eprintln!("Board error: {}", err);
            if let Err(e) = server.serve(&on_connected, on_process_error).await {
                eprintln!("Board stopped: {}", e);
            }
        });
        (runtime, socket_addr)
    }

    fn network(socket_addr: SocketAddr) -> ModbusTransport {
        ModbusTransport::new(TransportConfig::Network {
            host: socket_addr.ip().to_string(),
            port: socket_addr.port(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[test]
    fn defaults_match_common_relay_boards() {
        match TransportConfig::serial("/dev/ttyUSB0") {
            TransportConfig::Serial {
                baud_rate,
                stop_bits,
                parity,
                byte_size,
                timeout,
                ..
            } => {
                assert_eq!(baud_rate, 9600);
                assert_eq!(stop_bits, StopBits::One);
                assert_eq!(parity, Parity::None);
                assert_eq!(byte_size, DataBits::Eight);
                assert_eq!(timeout, Duration::from_secs(1));
            }
            other => panic!("Unexpected config {:?}", other),
        }
        assert_eq!(
            TransportConfig::network("10.0.0.7"),
            TransportConfig::Network {
                host: String::from("10.0.0.7"),
                port: 502,
                timeout: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn endpoints_are_displayed_per_link_type() {
        assert_eq!(
            TransportConfig::serial("/dev/ttyUSB0").to_string(),
            "rtu:///dev/ttyUSB0@9600"
        );
        assert_eq!(
            TransportConfig::network("10.0.0.7").to_string(),
            "tcp://10.0.0.7:502"
        );
    }

    #[test]
    fn close_is_safe_without_connect() {
        let mut transport = ModbusTransport::new(TransportConfig::network("127.0.0.1"));
        transport.close();
        transport.close();
        assert!(matches!(
            transport.read_coils(0, 8, SLAVE),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn requests_fail_as_link_errors_when_not_connected() {
        let mut transport = ModbusTransport::new(TransportConfig::network("127.0.0.1"));
        let err = transport.read_coils(0, 8, SLAVE).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(err.is_link());
        let err = transport.write_coil(0, true, SLAVE).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        let port = {
            let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut transport = ModbusTransport::new(TransportConfig::Network {
            host: String::from("127.0.0.1"),
            port,
            timeout: DEFAULT_TIMEOUT,
        });
        let err = transport.connect().unwrap_err();
        assert!(err
            .to_string()
            .starts_with(&format!("Failed to connect to 'tcp://127.0.0.1:{}'", port)));
        assert!(matches!(
            transport.read_coils(0, 8, SLAVE),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn modbus_errors_are_classified_by_kind() {
        let timeout: Result<Result<(), ExceptionCode>, tokio_modbus::Error> = Err(
            tokio_modbus::Error::Transport(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
        );
        let err = TransportError::from_modbus("read coils", timeout).unwrap_err();
        assert!(err.is_link());
        assert!(!err.is_exception());

        let rejected: Result<Result<(), ExceptionCode>, tokio_modbus::Error> =
            Ok(Err(ExceptionCode::IllegalDataAddress));
        let err = TransportError::from_modbus("write coil", rejected).unwrap_err();
        assert!(err.is_exception());
        assert!(matches!(
            err,
            TransportError::Exception {
                code: ExceptionCode::IllegalDataAddress,
                ..
            }
        ));
    }

    #[test]
    fn written_coils_read_back_over_tcp() {
        let (_runtime, socket_addr) = start_board();
        let mut transport = network(socket_addr);
        transport.connect().unwrap();

        for value in [true, false] {
            for address in 0..8u16 {
                transport.write_coil(address, value, SLAVE).unwrap();
                let coils = transport.read_coils(0, 8, SLAVE).unwrap();
                assert_eq!(coils.len(), 8);
                assert_eq!(coils[usize::from(address)], value);
            }
        }

        transport.close();
        assert!(matches!(
            transport.read_coils(0, 8, SLAVE),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn device_exceptions_are_not_link_errors() {
        let (_runtime, socket_addr) = start_board();
        let mut transport = network(socket_addr);
        transport.connect().unwrap();

        let err = transport.write_coil(8, true, SLAVE).unwrap_err();
        assert!(err.is_exception());
        let err = transport.read_coils(0, 9, SLAVE).unwrap_err();
        assert!(err.is_exception());

        // the session survives an exception
        assert!(transport.read_coils(0, 8, SLAVE).is_ok());
    }
}
