// Listener set: binds the HTTP and gRPC sockets together
// Binding is all-or-nothing; TLS applies to both listeners or neither

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::lifecycle::Listener;
use crate::tls;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub struct ListenerSet {
    pub http: TcpListener,
    pub grpc: TcpListener,
    pub http_addr: SocketAddr,
    pub grpc_addr: SocketAddr,
    pub tls: Option<TlsAcceptor>,
}

impl ListenerSet {
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        // TLS first: a bad key pair must fail before any socket is opened
        let tls = config.tls.as_ref().map(tls::build_acceptor).transpose()?;

        let (http, http_addr) = bind_one(Listener::Http, &config.hostname, config.http_port).await?;

        let (grpc, grpc_addr) =
            match bind_one(Listener::Grpc, &config.hostname, config.grpc_port).await {
                Ok(bound) => bound,
                Err(e) => {
                    tracing::warn!(
                        address = %http_addr,
                        "Releasing http listener after grpc bind failure"
                    );
                    drop(http);
                    return Err(e);
                }
            };

        tracing::info!(
            http = %http_addr,
            grpc = %grpc_addr,
            tls = tls.is_some(),
            "Listeners bound"
        );

        Ok(ListenerSet {
            http,
            grpc,
            http_addr,
            grpc_addr,
            tls,
        })
    }
}

async fn bind_one(
    listener: Listener,
    host: &str,
    port: u16,
) -> Result<(TcpListener, SocketAddr), ServerError> {
    let address = format!("{}:{}", host, port);
    let bind_error = |source| ServerError::Bind {
        listener: listener.as_str(),
        address: address.clone(),
        source,
    };

    let socket = TcpListener::bind((host, port)).await.map_err(bind_error)?;
    let local_addr = socket.local_addr().map_err(bind_error)?;

    Ok((socket, local_addr))
}
