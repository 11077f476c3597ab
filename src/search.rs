use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rand::Rng;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::ssdp::{
    Announce, AnnounceHandler, NotificationType, SearchMessage, UnicastAnnounce, SSDP_ADDR,
};

/// Searches repeat no faster than this regardless of the caller request
pub const MIN_SEARCH_FREQUENCY: Duration = Duration::from_secs(5);

const BIND_ATTEMPTS: usize = 20;

/// Search responses land on the search socket, not the shared multicast one
pub(crate) trait SearchResponseSink: Send + Sync {
    fn on_search_response(&self, response: &Announce, sender: SocketAddr);
}

/// Binds the search socket to a random ephemeral port. Never 1900 (that
/// would shadow the shared listener) and never a privileged port.
pub(crate) fn bind_search_socket(interface: Option<Ipv4Addr>) -> anyhow::Result<UdpSocket> {
    let mut rng = rand::rng();
    for _ in 0..BIND_ATTEMPTS {
        let port: u16 = rng.random_range(1025..=u16::MAX);
        if port == 1900 {
            continue;
        }
        let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if let Some(interface) = interface {
            socket.set_multicast_if_v4(&interface)?;
        }
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        if socket.bind(&SocketAddr::V4(addr).into()).is_ok() {
            return Ok(UdpSocket::from_std(socket.into())?);
        }
    }
    anyhow::bail!("failed to bind a search socket in {BIND_ATTEMPTS} attempts")
}

/// Periodic M-SEARCH task. Sends the search twice back to back, reads
/// responses until the repeat interval elapses, then sends again until
/// cancelled.
pub(crate) async fn search_task(
    st: NotificationType,
    mx: usize,
    frequency: Duration,
    interface: Option<Ipv4Addr>,
    user_agent: Option<String>,
    sink: Arc<dyn SearchResponseSink>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let socket = bind_search_socket(interface).context("bind search socket")?;
    let frequency = frequency.max(MIN_SEARCH_FREQUENCY);
    let message = SearchMessage {
        host: SSDP_ADDR,
        st,
        mx: Some(mx),
        user_agent: user_agent.as_deref(),
    }
    .to_string();

    let mut buf = [0; 2048];
    loop {
        for _ in 0..2 {
            socket
                .send_to(message.as_bytes(), SSDP_ADDR)
                .await
                .context("send search message")?;
        }
        let deadline = tokio::time::Instant::now() + frequency;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => break,
                recv = socket.recv_from(&mut buf) => {
                    let Ok((read, sender)) = recv else {
                        continue;
                    };
                    let Ok(payload) = std::str::from_utf8(&buf[..read]) else {
                        continue;
                    };
                    match UnicastAnnounce::parse_announce(payload) {
                        Ok(response) => sink.on_search_response(&response, sender),
                        Err(e) => tracing::trace!("Failed to parse search response: {e}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MIN_SEARCH_FREQUENCY;

    #[test]
    fn frequency_clamp() {
        let requested = Duration::from_secs(1);
        assert_eq!(requested.max(MIN_SEARCH_FREQUENCY), MIN_SEARCH_FREQUENCY);
        let requested = Duration::from_secs(30);
        assert_eq!(requested.max(MIN_SEARCH_FREQUENCY), requested);
    }
}
