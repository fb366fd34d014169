use crate::prelude::*;

use {
    async_trait::async_trait,
    net2::TcpStreamExt,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio::sync::Mutex,
};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;
const SERIAL_BAUD_RATE: u32 = 115_200;

/// Byte stream to the inverter's Bluetooth root device.
///
/// `destination` is the addressed device rendered as `AA:BB:CC:DD:EE:FF`;
/// point-to-point transports ignore it. `read` returns `Ok(0)` when nothing
/// arrived within `timeout_ms`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, data: &[u8], destination: &str) -> Result<usize>;
    async fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// [`Transport`] over any tokio byte stream: an RFCOMM tty bound with
/// `rfcomm bind`, or a TCP socket to a serial bridge.
pub struct StreamTransport {
    name: String,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
}

impl StreamTransport {
    pub fn new<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.to_string(),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// A device path opens a tty, anything else is taken as `host:port`.
    pub async fn open(address: &str) -> Result<Self> {
        if address.starts_with('/') {
            Self::open_device(address)
        } else {
            Self::connect_tcp(address).await
        }
    }

    pub async fn connect_tcp(address: &str) -> Result<Self> {
        info!("connecting to {}", address);

        let stream = match tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            tokio::net::TcpStream::connect(address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::Timeout("tcp connect")),
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
        let stream = tokio::net::TcpStream::from_std(std_stream)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        info!("{}: connected", address);
        Ok(Self::new(address, reader, writer))
    }

    /// Opens an RFCOMM tty, e.g. `/dev/rfcomm0` after `rfcomm bind`.
    pub fn open_device(path: &str) -> Result<Self> {
        info!("opening {}", path);
        let builder = tokio_serial::new(path, SERIAL_BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None);
        let port = tokio_serial::SerialStream::open(&builder).map_err(std::io::Error::from)?;
        let (reader, writer) = tokio::io::split(port);
        info!("{}: opened", path);
        Ok(Self::new(path, reader, writer))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn write(&self, data: &[u8], destination: &str) -> Result<usize> {
        trace!("{}: TX to {} {}", self.name, destination, Utils::hex(data));
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms as u64),
            reader.read(buf),
        )
        .await
        {
            Ok(Ok(0)) => Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed by peer", self.name),
            ))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(0),
        }
    }
}
