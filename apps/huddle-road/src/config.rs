use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "HUDDLE_ROAD_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// Postgres connection string for durable room records. Rooms are kept
    /// in memory when unset.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// HS256 secret used to verify access tokens.
    #[arg(long, env = "HUDDLE_ROAD_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Accept any non-empty token as a user id (development mode only).
    #[arg(long, env = "HUDDLE_ROAD_AUTH_BYPASS", default_value_t = false)]
    pub auth_bypass: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "HUDDLE_ROAD_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub auth_bypass: bool,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let jwt_secret = args.jwt_secret.filter(|secret| !secret.trim().is_empty());
        if jwt_secret.is_none() && !args.auth_bypass {
            bail!("HUDDLE_ROAD_JWT_SECRET is required unless HUDDLE_ROAD_AUTH_BYPASS is set");
        }
        Ok(ServerConfig {
            listen_addr,
            database_url: args.database_url.filter(|url| !url.trim().is_empty()),
            jwt_secret,
            auth_bypass: args.auth_bypass,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ServeArgs {
        ServeArgs {
            listen_addr: "127.0.0.1:3001".into(),
            database_url: None,
            jwt_secret: None,
            auth_bypass: false,
            shutdown_grace_secs: 2,
        }
    }

    #[test_timeout::timeout]
    fn secret_or_bypass_is_required() {
        assert!(ServerConfig::try_from(args()).is_err());

        let bypass = ServeArgs {
            auth_bypass: true,
            ..args()
        };
        assert!(ServerConfig::try_from(bypass).is_ok());

        let secret = ServeArgs {
            jwt_secret: Some("s3cret".into()),
            ..args()
        };
        let config = ServerConfig::try_from(secret).expect("config");
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }

    #[test_timeout::timeout]
    fn blank_values_are_treated_as_unset() {
        let config = ServerConfig::try_from(ServeArgs {
            database_url: Some("  ".into()),
            auth_bypass: true,
            ..args()
        })
        .expect("config");
        assert!(config.database_url.is_none());
    }

    #[test_timeout::timeout]
    fn bad_listen_addr_is_rejected() {
        let err = ServerConfig::try_from(ServeArgs {
            listen_addr: "nowhere".into(),
            auth_bypass: true,
            ..args()
        })
        .unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }
}
