//! LAN discovery over UDP multicast.
//!
//! The advertiser binds the well-known discovery port, joins the multicast
//! group, announces itself once and then answers every query carrying its
//! service name. Browsers send queries from an ephemeral port and take the
//! first matching announcement; the announcement's source address becomes
//! the service host.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Advertisement, DiscoveryError, ServiceAdvertiser, ServiceBrowser, ServiceRecord};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);
const DISCOVERY_PORT: u16 = 45454;
const QUERY_INTERVAL: Duration = Duration::from_millis(500);
const MAX_PACKET: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Packet {
    Query {
        name: String,
    },
    Announce {
        name: String,
        service_type: String,
        port: u16,
    },
}

fn encode(packet: &Packet) -> Result<Vec<u8>, DiscoveryError> {
    Ok(serde_json::to_vec(packet)?)
}

fn decode(bytes: &[u8]) -> Option<Packet> {
    serde_json::from_slice(bytes).ok()
}

#[derive(Debug, Clone, Copy)]
pub struct MulticastDiscovery {
    group: Ipv4Addr,
    port: u16,
}

impl Default for MulticastDiscovery {
    fn default() -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: DISCOVERY_PORT,
        }
    }
}

impl MulticastDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }

    fn listener_socket(&self) -> std::io::Result<UdpSocket> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port))?;
        std_sock.join_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        UdpSocket::from_std(std_sock)
    }

    fn query_socket(&self) -> std::io::Result<UdpSocket> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        UdpSocket::from_std(std_sock)
    }
}

#[async_trait]
impl ServiceBrowser for MulticastDiscovery {
    async fn find(
        &self,
        name: &str,
        window: Duration,
    ) -> Result<Option<ServiceRecord>, DiscoveryError> {
        let socket = self.query_socket()?;
        let query = encode(&Packet::Query {
            name: name.to_string(),
        })?;
        let deadline = Instant::now() + window;
        let mut buf = vec![0u8; MAX_PACKET];

        while Instant::now() < deadline {
            if let Err(err) = socket.send_to(&query, self.group_addr()).await {
                debug!(error = %err, "multicast query send failed");
            }
            let round_end = (Instant::now() + QUERY_INTERVAL).min(deadline);
            loop {
                let recv = tokio::time::timeout_at(round_end, socket.recv_from(&mut buf)).await;
                let (len, from) = match recv {
                    Err(_) => break,
                    Ok(Err(err)) => {
                        debug!(error = %err, "multicast receive failed");
                        break;
                    }
                    Ok(Ok(received)) => received,
                };
                if let Some(Packet::Announce {
                    name: announced,
                    service_type,
                    port,
                }) = decode(&buf[..len])
                {
                    if announced == name {
                        info!(service = %announced, host = %from.ip(), port, "found advertised service");
                        return Ok(Some(ServiceRecord {
                            name: announced,
                            service_type,
                            host: from.ip().to_string(),
                            port,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ServiceAdvertiser for MulticastDiscovery {
    async fn publish(&self, record: ServiceRecord) -> Result<Advertisement, DiscoveryError> {
        let socket = self.listener_socket()?;
        let announce = encode(&Packet::Announce {
            name: record.name.clone(),
            service_type: record.service_type.clone(),
            port: record.port,
        })?;
        if let Err(err) = socket.send_to(&announce, self.group_addr()).await {
            warn!(error = %err, "initial service announcement failed");
        }

        let name = record.name.clone();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "discovery responder stopped");
                        break;
                    }
                };
                match decode(&buf[..len]) {
                    Some(Packet::Query { name: wanted }) if wanted == name => {
                        if let Err(err) = socket.send_to(&announce, from).await {
                            debug!(error = %err, peer = %from, "announcement reply failed");
                        }
                    }
                    _ => {}
                }
            }
        });

        info!(service = %record.name, port = record.port, "advertising service on the local network");
        Ok(Advertisement::new(record, move || responder.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_tagged_json() {
        let bytes = encode(&Packet::Query {
            name: "LocalBeam Signaling Server".into(),
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"op":"query","name":"LocalBeam Signaling Server"}"#
        );
    }

    #[test]
    fn decode_ignores_foreign_traffic() {
        assert_eq!(decode(b"\x00\x01garbage"), None);
        assert_eq!(
            decode(br#"{"op":"announce","name":"a","service_type":"http","port":5000}"#),
            Some(Packet::Announce {
                name: "a".into(),
                service_type: "http".into(),
                port: 5000
            })
        );
    }
}
