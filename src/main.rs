use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use jac_irc_proxy::admin::{self, AdminState};
use jac_irc_proxy::config::Config;
use jac_irc_proxy::listener::Listener;
use jac_irc_proxy::ratelimit::RateLimiter;
use jac_irc_proxy::registry::SessionRegistry;
use jac_irc_proxy::session::SessionContext;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("jac-irc-proxy {} starting", env!("CARGO_PKG_VERSION"));
    info!("gateway: {}", config.ws_url);

    if config.admin_token.is_none() {
        warn!("ADMIN_TOKEN is not set; the admin api will reject all requests");
    }

    let config = Arc::new(config);
    let limiter = Arc::new(RateLimiter::new(config.rate));
    let registry = Arc::new(SessionRegistry::new());
    limiter.attach_registry(Arc::clone(&registry));

    let admin_state = AdminState::new(
        config.admin_token.clone(),
        Arc::clone(&limiter),
        Arc::clone(&registry),
    );
    let admin_listener = admin::bind(config.admin_port).await?;
    tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_listener, admin_state).await {
            error!("admin api failed: {e}");
        }
    });

    let ctx = SessionContext {
        config: Arc::clone(&config),
        limiter,
        registry: Arc::clone(&registry),
    };
    let listener = Listener::bind(&config, ctx).await?;

    tokio::select! {
        result = listener.serve() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            registry.close_all();
        }
    }

    Ok(())
}
