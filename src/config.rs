#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum PortalKind {
    Stalker,
    Xtream,
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // where the rolling log files go in production
    #[clap(long, env, default_value = "logs")]
    pub log_dir: String,

    // redis is optional, without it proxy health and drm records live in memory and are lost on
    // restart
    #[clap(long, env)]
    pub redis_url: Option<String>,

    // prefix for every redis key, for relays sharing one instance
    #[clap(long, env)]
    pub redis_namespace: Option<String>,

    // external origin of this service, e.g. https://edge.example.com
    // if it's missing it gets derived from the Host/X-Forwarded-Proto headers per request
    #[clap(long, env)]
    pub public_base_url: Option<String>,

    // sent upstream whenever the caller doesn't pass a ua param
    #[clap(long, env, default_value = DEFAULT_USER_AGENT)]
    pub default_user_agent: String,

    // which protocol the configured portal speaks
    #[clap(long, env, value_enum, default_value = "xtream")]
    pub portal_kind: PortalKind,

    // stalker: http://host/stalker_portal/server/load.php or just http://host
    // xtream: http://host:port
    #[clap(long, env)]
    pub portal_url: Option<String>,

    // stalker only
    #[clap(long, env)]
    pub portal_mac: Option<String>,

    // xtream only
    #[clap(long, env)]
    pub portal_username: Option<String>,

    #[clap(long, env)]
    pub portal_password: Option<String>,

    // proxy candidates in order of preference, unset ones are skipped
    #[clap(long, env)]
    pub proxy_primary: Option<String>,

    #[clap(long, env)]
    pub proxy_backup: Option<String>,

    #[clap(long, env)]
    pub proxy_backup2: Option<String>,

    #[clap(long, env)]
    pub proxy_cloud: Option<String>,

    // how long a failed proxy stays deprioritized
    #[clap(long, env, default_value = "3600")]
    pub proxy_cooldown_secs: u64,

    // only the portal client gets a timeout, stream fetches use the platform default
    #[clap(long, env, default_value = "30")]
    pub upstream_timeout_secs: u64,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// configured proxy bases paired with their labels, in preference order
    pub fn proxy_candidates(&self) -> Vec<(String, String)> {
        [
            ("primary", &self.proxy_primary),
            ("backup", &self.proxy_backup),
            ("backup2", &self.proxy_backup2),
            ("cloud", &self.proxy_cloud),
        ]
        .into_iter()
        .filter_map(|(label, base)| {
            base.as_ref()
                .filter(|b| !b.trim().is_empty())
                .map(|b| (label.to_string(), b.trim().to_string()))
        })
        .collect()
    }
}

impl Default for AppConfig {
    // mostly for tests, real deployments go through clap
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            log_dir: "logs".to_string(),
            redis_url: None,
            redis_namespace: None,
            public_base_url: None,
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            portal_kind: PortalKind::Xtream,
            portal_url: None,
            portal_mac: None,
            portal_username: None,
            portal_password: None,
            proxy_primary: None,
            proxy_backup: None,
            proxy_backup2: None,
            proxy_cloud: None,
            proxy_cooldown_secs: 3600,
            upstream_timeout_secs: 30,
            sentry_dsn: None,
        }
    }
}
