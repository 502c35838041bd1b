//! Daemon configuration: TOML file, environment-variable overrides, and
//! command-line overrides, in that precedence order.
//!
//! Environment variables use the `GRIPD_` prefix with `__` as the section
//! separator (`GRIPD_GLOBAL__LOG_LEVEL=3`). Endpoint specs support
//! `{ipc_prefix}` interpolation, and `tcp://host:PORT` specs are rewritten
//! by the port offset. Validation collects every problem before startup
//! instead of stopping at the first.

use clap::Parser;
use config::Config as ConfigLoader;
use serde::{Deserialize, Serialize};

/// Command-line interface.
#[derive(Parser, Debug, Clone)]
#[command(name = "gripd", version, about = "GRIP-aware realtime reverse proxy")]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "gripd.toml")]
    pub config: String,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub logfile: Option<String>,

    /// Log level: 0=error .. 4=trace
    #[arg(long)]
    pub loglevel: Option<u8>,

    /// Shorthand for --loglevel=3
    #[arg(long)]
    pub verbose: bool,

    /// Prefix applied to every in-process endpoint name
    #[arg(long)]
    pub ipc_prefix: Option<String>,

    /// Add a route line (repeatable): "<host>[,props] <target>..."
    #[arg(long = "route")]
    pub routes: Vec<String>,

    /// Offset added to every tcp:// endpoint port
    #[arg(long)]
    pub port_offset: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Instance identity prefix; component ids derive from it.
    pub instance_id: String,
    pub ipc_prefix: String,
    pub port_offset: u16,
    pub log_level: u8,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            instance_id: "gripd".into(),
            ipc_prefix: String::new(),
            port_offset: 0,
            log_level: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// External web server endpoints (edge adapter side).
    pub ext_in: String,
    pub ext_out: String,
    pub ext_control: String,
    /// Edge-to-worker ZHTTP base.
    pub edge_base: String,
    /// Worker-to-origin ZHTTP base.
    pub origin_base: String,
    pub accept: String,
    pub publish: String,
    pub wscontrol_in: String,
    pub wscontrol_out: String,
    pub stats: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            ext_in: "{ipc_prefix}ext-in".into(),
            ext_out: "{ipc_prefix}ext-out".into(),
            ext_control: "{ipc_prefix}ext-control".into(),
            edge_base: "{ipc_prefix}zhttp".into(),
            origin_base: "{ipc_prefix}zhttp-out".into(),
            accept: "{ipc_prefix}accept".into(),
            publish: "{ipc_prefix}publish".into(),
            wscontrol_in: "{ipc_prefix}wscontrol-in".into(),
            wscontrol_out: "{ipc_prefix}wscontrol-out".into(),
            stats: "{ipc_prefix}stats".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Response-buffer credit granted per edge session.
    pub client_buffer: u32,
    pub connection_ttl_secs: u64,
    pub subscription_ttl_secs: u64,
    pub subscription_linger_secs: u64,
    pub report_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            client_buffer: 100_000,
            connection_ttl_secs: 120,
            subscription_ttl_secs: 60,
            subscription_linger_secs: 60,
            report_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub global: GlobalConfig,
    pub endpoints: EndpointsConfig,
    pub limits: LimitsConfig,
    /// Route lines, same grammar as `--route`.
    pub routes: Vec<String>,
}

impl ServerConfig {
    /// Validate, collecting every error.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.global.instance_id.is_empty() {
            errors.push("global.instance_id must not be empty".into());
        }
        if self.global.instance_id.contains(' ') {
            errors.push("global.instance_id must not contain spaces".into());
        }
        if self.global.log_level > 4 {
            errors.push("global.log_level must be 0..=4".into());
        }
        if self.limits.client_buffer == 0 {
            errors.push("limits.client_buffer must be nonzero".into());
        }

        if self.routes.is_empty() {
            errors.push("no routes configured; add [routes] or --route".into());
        }
        for (n, line) in self.routes.iter().enumerate() {
            if let Err(e) = gripd_proxy::RouteEntry::parse(line) {
                errors.push(format!("route[{n}]: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Interpolate `{ipc_prefix}` and apply the port offset to a spec.
    pub fn resolve_endpoint(&self, spec: &str) -> String {
        let mut out = spec.replace("{ipc_prefix}", &self.global.ipc_prefix);
        if self.global.port_offset != 0 {
            if let Some(rest) = out.strip_prefix("tcp://") {
                if let Some((host, port)) = rest.rsplit_once(':') {
                    if let Ok(port) = port.parse::<u16>() {
                        out = format!("tcp://{host}:{}", port + self.global.port_offset);
                    }
                }
            }
        }
        out
    }
}

/// Load configuration: defaults, then file, then environment variables,
/// then CLI overrides (highest precedence).
pub fn load_config(cli: &CliArgs) -> anyhow::Result<ServerConfig> {
    let mut config = load_config_file(&cli.config)?;

    apply_env_overrides(&mut config)?;

    if let Some(prefix) = &cli.ipc_prefix {
        config.global.ipc_prefix = prefix.clone();
    }
    if let Some(offset) = cli.port_offset {
        config.global.port_offset = offset;
    }
    if cli.verbose {
        config.global.log_level = 3;
    }
    if let Some(level) = cli.loglevel {
        config.global.log_level = level;
    }
    config.routes.extend(cli.routes.iter().cloned());

    config.validate().map_err(|errors| {
        anyhow::anyhow!("configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

fn load_config_file(path: &str) -> anyhow::Result<ServerConfig> {
    use anyhow::Context;

    if !std::path::Path::new(path).exists() {
        tracing::warn!(config_path = %path, "configuration file not found, using defaults");
        return Ok(ServerConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path}"))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse TOML config: {path}"))
}

/// Apply environment variable overrides.
///
/// Variables are prefixed with `GRIPD_` and use `__` as a separator:
/// `GRIPD_GLOBAL__INSTANCE_ID=edge-a`, `GRIPD_GLOBAL__PORT_OFFSET=10`,
/// `GRIPD_LIMITS__CLIENT_BUFFER=200000`.
fn apply_env_overrides(config: &mut ServerConfig) -> anyhow::Result<()> {
    use anyhow::Context;

    let env = ConfigLoader::builder()
        .add_source(config::Environment::with_prefix("GRIPD").separator("__"))
        .build()
        .context("failed to load environment variables")?;

    // apply known overrides directly rather than re-deserializing the
    // whole tree, so a stray unrelated GRIPD_* variable cannot wedge
    // startup
    if let Ok(id) = env.get_string("global.instance_id") {
        config.global.instance_id = id;
    }
    if let Ok(prefix) = env.get_string("global.ipc_prefix") {
        config.global.ipc_prefix = prefix;
    }
    if let Ok(offset) = env.get_int("global.port_offset") {
        config.global.port_offset = offset as u16;
    }
    if let Ok(level) = env.get_int("global.log_level") {
        config.global.log_level = level as u8;
    }
    if let Ok(buffer) = env.get_int("limits.client_buffer") {
        config.limits.client_buffer = buffer as u32;
    }

    Ok(())
}
