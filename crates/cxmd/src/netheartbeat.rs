//! UDP transport of the heartbeat and election messages.
//!
//! Every message goes out as one datagram, either broadcast to the whole
//! segment or unicast to a resolved node. Datagrams tagged with another
//! cluster name are dropped on receipt.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use cxm_core::net::{create_heartbeat_socket, send_datagram};
use cxm_core::resolver::Resolver;
use cxm_proto::defaults::{DEFAULT_SEND_BACKOFF, DEFAULT_SEND_RETRIES, MAX_DATAGRAM_SIZE};
use cxm_proto::error::CxmResult;
use cxm_proto::message::{Message, MessageCodec};

use crate::config::ClusterConfig;
use crate::coordinator::{Dest, Input};

pub struct HeartbeatTransport {
    socket: Arc<UdpSocket>,
    codec: Arc<MessageCodec>,
    resolver: Arc<dyn Resolver>,
    port: u16,
}

impl HeartbeatTransport {
    pub async fn bind(config: &ClusterConfig, resolver: Arc<dyn Resolver>) -> CxmResult<Self> {
        let socket = create_heartbeat_socket(&config.bind_addr, config.udp_port).await?;
        Ok(Self::from_socket(
            socket,
            &config.cluster,
            resolver,
            config.udp_port,
        ))
    }

    pub fn from_socket(
        socket: UdpSocket,
        cluster: &str,
        resolver: Arc<dyn Resolver>,
        port: u16,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            codec: Arc::new(MessageCodec::new(cluster)),
            resolver,
            port,
        }
    }

    pub fn local_addr(&self) -> CxmResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Address of `dest`. Lookups are retried like sends.
    async fn target(&self, dest: &Dest) -> CxmResult<SocketAddr> {
        let name = match dest {
            Dest::Broadcast => return Ok(SocketAddr::new(self.resolver.broadcast(), self.port)),
            Dest::Node(name) => name,
        };
        let mut attempt = 0;
        loop {
            match self.resolver.resolve(name).await {
                Ok(ip) => return Ok(SocketAddr::new(ip, self.port)),
                Err(e) if attempt < DEFAULT_SEND_RETRIES => {
                    debug!("netheartbeat: cannot resolve {} ({}), retrying", name, e);
                    attempt += 1;
                    tokio::time::sleep(DEFAULT_SEND_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encode and send one message.
    pub async fn send(&self, msg: &Message, dest: &Dest) -> CxmResult<()> {
        let frame = self.codec.encode(msg)?;
        let target = self.target(dest).await?.to_string();
        trace!("netheartbeat: {} to {}", msg.kind(), target);

        let res = send_datagram(
            &self.socket,
            &frame,
            &target,
            DEFAULT_SEND_RETRIES,
            DEFAULT_SEND_BACKOFF,
        )
        .await;
        if res.is_err() {
            // The address may have moved.
            if let Dest::Node(name) = dest {
                self.resolver.forget(name);
            }
        }
        res
    }

    /// Feed every received message to the coordinator until shutdown.
    pub fn spawn_listener(&self, inputs: mpsc::Sender<Input>, shutdown: Arc<Notify>) {
        let socket = self.socket.clone();
        let codec = self.codec.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("netheartbeat: listener shutting down");
                        break;
                    }
                    recv = socket.recv_from(&mut buf) => {
                        let (len, peer) = match recv {
                            Ok(r) => r,
                            Err(e) => {
                                warn!("netheartbeat: receive error: {}", e);
                                continue;
                            }
                        };
                        match codec.decode(&buf[..len]) {
                            Ok(Some(msg)) => {
                                if inputs.send(Input::Message(msg)).await.is_err() {
                                    debug!("netheartbeat: coordinator gone, listener stopping");
                                    break;
                                }
                            }
                            Ok(None) => trace!("netheartbeat: foreign cluster datagram from {}", peer),
                            Err(e) => warn!("netheartbeat: bad datagram from {}: {}", peer, e),
                        }
                    }
                }
            }
        });
    }
}
