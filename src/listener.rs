/// Client-facing listeners.
///
/// One plaintext TCP listener, plus an optional TLS listener when SSL is
/// enabled. Admission control happens here, before a session task is ever
/// spawned: banned addresses and addresses over their connection quota are
/// dropped without a single byte written back.
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::session::{self, SessionContext};
use crate::tls;

pub struct Listener {
    plain: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
    ctx: SessionContext,
}

impl Listener {
    /// Bind the configured listeners. Fails fast on port conflicts and on
    /// bad TLS material.
    pub async fn bind(config: &Config, ctx: SessionContext) -> Result<Self, ProxyError> {
        let plain = TcpListener::bind((config.host.as_str(), config.port)).await?;
        info!("irc listening on {}", plain.local_addr()?);

        let tls = if config.ssl_enabled {
            let acceptor =
                tls::build_acceptor(Path::new(&config.ssl_cert), Path::new(&config.ssl_key))?;
            let listener = TcpListener::bind((config.host.as_str(), config.ssl_port)).await?;
            info!("irc+tls listening on {}", listener.local_addr()?);
            Some((listener, acceptor))
        } else {
            None
        };

        Ok(Self { plain, tls, ctx })
    }

    /// Address of the plaintext listener (useful with port 0).
    pub fn plain_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.plain.local_addr()?)
    }

    /// Address of the TLS listener, when enabled.
    pub fn tls_addr(&self) -> Result<Option<SocketAddr>, ProxyError> {
        match &self.tls {
            Some((listener, _)) => Ok(Some(listener.local_addr()?)),
            None => Ok(None),
        }
    }

    /// Accept connections until the process shuts down.
    pub async fn serve(self) -> Result<(), ProxyError> {
        let Self { plain, tls, ctx } = self;

        match tls {
            Some((tls_listener, acceptor)) => {
                let tls_ctx = ctx.clone();
                let tls_task = tokio::spawn(async move {
                    accept_loop(tls_listener, tls_ctx, Some(acceptor)).await
                });
                let plain_task =
                    tokio::spawn(async move { accept_loop(plain, ctx, None).await });

                // Neither loop returns unless its listener breaks.
                let (a, b) = tokio::join!(plain_task, tls_task);
                a.map_err(|e| ProxyError::Config(e.to_string()))??;
                b.map_err(|e| ProxyError::Config(e.to_string()))??;
                Ok(())
            }
            None => accept_loop(plain, ctx, None).await,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: SessionContext,
    acceptor: Option<TlsAcceptor>,
) -> Result<(), ProxyError> {
    loop {
        let (socket, addr) = listener.accept().await?;
        admit(socket, addr, &ctx, acceptor.clone());
    }
}

/// Run admission control and spawn the session task for one connection.
fn admit(socket: TcpStream, addr: SocketAddr, ctx: &SessionContext, acceptor: Option<TlsAcceptor>) {
    let ip = addr.ip();

    if ctx.limiter.is_banned(ip) {
        warn!(%addr, "dropping connection from banned address");
        return;
    }
    if !ctx.limiter.allow_connection(ip) {
        info!(%addr, "dropping connection over admission quota");
        return;
    }

    let handle = ctx.registry.register(ip, acceptor.is_some());
    debug!(%addr, id = handle.id, tls = handle.tls, "connection admitted");

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let id = handle.id;
        let result = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(stream) => session::run_session(stream, Arc::clone(&handle), ctx.clone()).await,
                Err(e) => {
                    // Port scanners and protocol mismatches land here.
                    debug!(%addr, "tls handshake failed: {e}");
                    Ok(())
                }
            },
            None => session::run_session(socket, Arc::clone(&handle), ctx.clone()).await,
        };
        if let Err(e) = result {
            debug!(%addr, id, "session ended with error: {e}");
        }
        ctx.registry.deregister(id);
        info!(%addr, id, "disconnected");
    });
}
