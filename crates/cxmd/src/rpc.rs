//! The two RPC services of the daemon.
//!
//! * remote, TCP on `rpc_port`: registration, unregistration and panic
//!   requests from the other members, answered by the active leader;
//! * local, Unix socket: operator requests from `cxmctl`.
//!
//! Both turn each request into an `Input::Command` and wait for the
//! coordinator's reply, bounded by `TM_RPC`.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use cxm_core::net::{call, connect_to, read_frame, write_frame};
use cxm_core::resolver::Resolver;
use cxm_proto::defaults::TM_RPC;
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::rpc::{LocalRequest, RemoteRequest, Response};

use crate::coordinator::{Command, Input};

/// Hand one command to the coordinator and wait for its reply.
pub async fn dispatch(inputs: &mpsc::Sender<Input>, command: Command) -> Response {
    let (reply, rx) = oneshot::channel();
    if inputs.send(Input::Command { command, reply }).await.is_err() {
        return Response::Error(CxmError::Shutdown);
    }
    match tokio::time::timeout(TM_RPC, rx).await {
        Ok(Ok(response)) => response,
        // Reply dropped: the coordinator stopped before answering.
        Ok(Err(_)) => Response::Error(CxmError::Shutdown),
        Err(_) => Response::Error(CxmError::Timeout),
    }
}

/// Names carried by remote requests must resolve before reaching the
/// coordinator.
async fn check_remote(resolver: &dyn Resolver, req: &RemoteRequest) -> CxmResult<()> {
    match req {
        RemoteRequest::Register { name } | RemoteRequest::Unregister { name } => {
            resolver.resolve(name).await.map(|_| ()).map_err(|e| match e {
                e @ CxmError::NodeRefused(_) => e,
                other => CxmError::NodeRefused(other.to_string()),
            })
        }
        RemoteRequest::Panic => Ok(()),
    }
}

async fn handle_remote<S>(
    mut stream: S,
    resolver: Arc<dyn Resolver>,
    inputs: mpsc::Sender<Input>,
) -> CxmResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let req: RemoteRequest = read_frame(&mut stream).await?;
        debug!("rpc: remote request {:?}", req);
        let response = match check_remote(resolver.as_ref(), &req).await {
            Ok(()) => dispatch(&inputs, Command::Remote(req)).await,
            Err(e) => {
                info!("rpc: {}", e);
                Response::Error(e)
            }
        };
        write_frame(&mut stream, &response).await?;
    }
}

async fn handle_local<S>(mut stream: S, inputs: mpsc::Sender<Input>) -> CxmResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let req: LocalRequest = read_frame(&mut stream).await?;
        debug!("rpc: local request {:?}", req);
        let response = dispatch(&inputs, Command::Local(req)).await;
        write_frame(&mut stream, &response).await?;
    }
}

/// Accept loop of the remote service.
pub async fn serve_remote(
    listener: TcpListener,
    resolver: Arc<dyn Resolver>,
    inputs: mpsc::Sender<Input>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("rpc: accepted connection from {}", peer);
                        stream.set_nodelay(true).ok();
                        let resolver = resolver.clone();
                        let inputs = inputs.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_remote(stream, resolver, inputs).await {
                                debug!("rpc: client {} disconnected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("rpc: accept error: {}", e);
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("rpc: remote service shutting down");
                break;
            }
        }
    }
}

/// Bind the local control socket, replacing a stale one.
pub fn bind_local(path: &Path) -> CxmResult<UnixListener> {
    if path.exists() {
        debug!("rpc: removing stale socket {}", path.display());
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path).map_err(|e| {
        error!("rpc: failed to bind {}: {}", path.display(), e);
        CxmError::NetworkError(e.to_string())
    })?;
    debug!("rpc: listening on {}", path.display());
    Ok(listener)
}

/// Accept loop of the local operator service.
pub async fn serve_local(
    listener: UnixListener,
    inputs: mpsc::Sender<Input>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let inputs = inputs.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_local(stream, inputs).await {
                                debug!("rpc: local client disconnected: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("rpc: local accept error: {}", e);
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("rpc: local service shutting down");
                break;
            }
        }
    }
}

/// Call the remote service of `leader`.
pub async fn call_leader(
    resolver: &dyn Resolver,
    port: u16,
    leader: &str,
    req: &RemoteRequest,
) -> CxmResult<Response> {
    let ip = resolver.resolve(leader).await?;
    let mut stream = match connect_to(&ip.to_string(), port).await {
        Ok(s) => s,
        Err(e) => {
            resolver.forget(leader);
            return Err(e);
        }
    };
    call(&mut stream, req).await
}
