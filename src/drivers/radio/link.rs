use async_trait::async_trait;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::net::UdpSocket;

/// One frame received from the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub bytes: Vec<u8>,
    /// Received signal strength when the modem reports it.
    pub link_quality: Option<i8>,
}

/// Physical radio link. Half duplex; one writer and one reader at a time.
#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    async fn recv(&self) -> io::Result<LinkFrame>;
}

/// Stand-in for the modem: frames travel as UDP datagrams to and from the
/// ground station.
pub struct UdpLink {
    socket: UdpSocket,
    ground: SocketAddr,
}

impl UdpLink {
    /// Must be called from inside a tokio runtime.
    pub fn bind(local: &str, ground: &str) -> io::Result<Self> {
        let ground = ground.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("ground address '{ground}' did not resolve"),
            )
        })?;
        let socket = std::net::UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            ground,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl RadioLink for UdpLink {
    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let written = self.socket.send_to(frame, self.ground).await?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short radio write: {written} of {} bytes", frame.len()),
            ));
        }
        Ok(())
    }

    async fn recv(&self) -> io::Result<LinkFrame> {
        let mut buf = [0u8; 2048];
        let (len, _peer) = self.socket.recv_from(&mut buf).await?;
        Ok(LinkFrame {
            bytes: buf[..len].to_vec(),
            link_quality: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_link_exchanges_frames() {
        let ground = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ground_addr = ground.local_addr().unwrap().to_string();
        let link = UdpLink::bind("127.0.0.1:0", &ground_addr).unwrap();

        link.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = ground.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);

        ground.send_to(&[9, 8], from).await.unwrap();
        let frame = link.recv().await.unwrap();
        assert_eq!(frame.bytes, vec![9, 8]);
        assert_eq!(frame.link_quality, None);
    }
}
