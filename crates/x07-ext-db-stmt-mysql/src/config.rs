use anyhow::{bail, Context as _, Result};
use mysql_async::{OptsBuilder, SslOpts};

const ENV_PREFIX: &str = "X07_DB_MYSQL_";

#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub db: String,
    pub require_tls: bool,
    pub require_verify: bool,
    pub connect_timeout_ms: u32,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        MysqlConfig {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: String::new(),
            pass: String::new(),
            db: String::new(),
            require_tls: false,
            require_verify: true,
            connect_timeout_ms: 30_000,
        }
    }
}

impl MysqlConfig {
    /// Reads `X07_DB_MYSQL_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let d = MysqlConfig::default();
        let port = match env_str("PORT") {
            Some(v) => v
                .parse::<u16>()
                .with_context(|| format!("{ENV_PREFIX}PORT is not a port number: {v:?}"))?,
            None => d.port,
        };
        let cfg = MysqlConfig {
            host: env_str("HOST").unwrap_or(d.host),
            port,
            user: env_str("USER").unwrap_or(d.user),
            pass: env_str("PASS").unwrap_or(d.pass),
            db: env_str("DB").unwrap_or(d.db),
            require_tls: env_bool("REQUIRE_TLS", d.require_tls),
            require_verify: env_bool("REQUIRE_VERIFY", d.require_verify),
            connect_timeout_ms: env_u32_nonzero("CONNECT_TIMEOUT_MS", d.connect_timeout_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("mysql host must not be empty");
        }
        if self.port == 0 {
            bail!("mysql port must not be zero");
        }
        Ok(())
    }

    pub(crate) fn opts(&self) -> OptsBuilder {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .stmt_cache_size(0)
            .user((!self.user.is_empty()).then(|| self.user.clone()))
            .pass((!self.pass.is_empty()).then(|| self.pass.clone()))
            .db_name((!self.db.is_empty()).then(|| self.db.clone()));
        if self.require_tls {
            let mut ssl = SslOpts::default();
            if !self.require_verify {
                ssl = ssl.with_danger_accept_invalid_certs(true);
            }
            opts = opts.ssl_opts(Some(ssl));
        }
        opts
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    env_str(name)
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u32_nonzero(name: &str, default: u32) -> u32 {
    env_str(name)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&v| v != 0)
        .unwrap_or(default)
}
