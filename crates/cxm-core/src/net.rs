//! Async socket I/O for the cxm RPC services.
//!
//! Wire format, both directions: `u32 length prefix (big-endian) + bincode(payload)`.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixStream};
use tracing::{debug, error};

use cxm_proto::defaults::{MAX_RPC_FRAME_SIZE, TM_RPC};
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::rpc::Response;

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(stream: &mut W, payload: &T) -> CxmResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(payload).map_err(|e| CxmError::Malformed(e.to_string()))?;
    if data.len() > MAX_RPC_FRAME_SIZE as usize {
        return Err(CxmError::InvalidParms(format!(
            "frame of {} bytes too large",
            data.len()
        )));
    }
    stream
        .write_u32(data.len() as u32)
        .await
        .map_err(|e| CxmError::NetworkError(e.to_string()))?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| CxmError::NetworkError(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| CxmError::NetworkError(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(stream: &mut R) -> CxmResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = stream
        .read_u32()
        .await
        .map_err(|e| CxmError::NetworkError(e.to_string()))? as usize;

    // Protects against corrupt length prefixes
    if len > MAX_RPC_FRAME_SIZE as usize {
        return Err(CxmError::Malformed(format!("frame length {} too large", len)));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| CxmError::NetworkError(e.to_string()))?;

    bincode::deserialize(&buf).map_err(|e| CxmError::Malformed(e.to_string()))
}

/// Send one request on an established stream and wait for the reply.
pub async fn call<S, T>(stream: &mut S, req: &T) -> CxmResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let exchange = async {
        write_frame(stream, req).await?;
        read_frame::<_, Response>(stream).await
    };
    match tokio::time::timeout(TM_RPC, exchange).await {
        Ok(resp) => resp,
        Err(_) => Err(CxmError::Timeout),
    }
}

/// Connect to a remote daemon by address and port.
pub async fn connect_to(addr: &str, port: u16) -> CxmResult<TcpStream> {
    let target = format!("{}:{}", addr, port);
    debug!("rpc: connecting to {}", target);

    let stream = match tokio::time::timeout(TM_RPC, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(CxmError::NetworkError(format!("{}: {}", target, e))),
        Err(_) => return Err(CxmError::Timeout),
    };

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connect to the local daemon's control socket.
pub async fn connect_local(path: &Path) -> CxmResult<UnixStream> {
    UnixStream::connect(path)
        .await
        .map_err(|e| CxmError::NetworkError(format!("{}: {}", path.display(), e)))
}

/// Create a TCP listener on the given address and port.
pub async fn create_listen_socket(bind_addr: &str, port: u16) -> CxmResult<TcpListener> {
    let addr = format!("{}:{}", bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("rpc: failed to bind to {}: {}", addr, e);
        CxmError::NetworkError(e.to_string())
    })?;

    debug!("rpc: listening on {}", addr);
    Ok(listener)
}

/// Bind the heartbeat UDP socket with broadcast enabled.
pub async fn create_heartbeat_socket(bind_addr: &str, port: u16) -> CxmResult<UdpSocket> {
    let addr = format!("{}:{}", bind_addr, port);
    let socket = UdpSocket::bind(&addr).await.map_err(|e| {
        error!("netheartbeat: failed to bind to {}: {}", addr, e);
        CxmError::NetworkError(e.to_string())
    })?;
    socket
        .set_broadcast(true)
        .map_err(|e| CxmError::NetworkError(e.to_string()))?;

    debug!("netheartbeat: listening on {}", addr);
    Ok(socket)
}

/// Send a datagram, retrying `retries` times with a fixed backoff.
pub async fn send_datagram(
    socket: &UdpSocket,
    frame: &[u8],
    target: &str,
    retries: u32,
    backoff: Duration,
) -> CxmResult<()> {
    let mut attempt = 0;
    loop {
        match socket.send_to(frame, target).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < retries => {
                debug!("netheartbeat: send to {} failed ({}), retrying", target, e);
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!("netheartbeat: send to {} failed: {}", target, e);
                return Err(CxmError::NetworkError(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxm_proto::rpc::{LocalRequest, RemoteRequest};

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = RemoteRequest::Register {
            name: "node1".into(),
        };
        write_frame(&mut a, &req).await.unwrap();
        let back: RemoteRequest = read_frame(&mut b).await.unwrap();
        assert_eq!(back, req);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(u32::MAX).await.unwrap();
        let res: CxmResult<LocalRequest> = read_frame(&mut b).await;
        assert!(matches!(res, Err(CxmError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let srv = tokio::spawn(async move {
            let req: LocalRequest = read_frame(&mut server).await.unwrap();
            assert_eq!(req, LocalRequest::Ping);
            write_frame(&mut server, &Response::Pong).await.unwrap();
        });
        let resp = call(&mut client, &LocalRequest::Ping).await.unwrap();
        assert_eq!(resp, Response::Pong);
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_is_network_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);
        let res = call(&mut client, &LocalRequest::Ping).await;
        assert!(matches!(res, Err(CxmError::NetworkError(_))));
    }

    #[tokio::test]
    async fn test_send_datagram_loopback() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = rx.local_addr().unwrap().to_string();
        let tx = create_heartbeat_socket("127.0.0.1", 0).await.unwrap();

        send_datagram(&tx, b"hello", &target, 2, Duration::from_millis(10))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
