use std::io;
use std::net::SocketAddr;
use tokio::net::{ToSocketAddrs, UdpSocket};

/// Port the WeatherFlow hub broadcasts its observations on.
pub const PORT: u16 = 50222;

/// Comfortably above the largest hub message.
const BUFFER_SIZE: usize = 2000;

/// Something that yields one text payload per call.
pub trait PayloadSource {
    async fn recv(&mut self) -> io::Result<String>;
}

pub struct Listener {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            buf: vec![0; BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PayloadSource for Listener {
    /// Reads one datagram and decodes it as text. The sender's address is dropped.
    async fn recv(&mut self) -> io::Result<String> {
        let (n, _) = self.socket.recv_from(&mut self.buf).await?;
        Ok(String::from_utf8_lossy(&self.buf[..n]).into_owned())
    }
}
