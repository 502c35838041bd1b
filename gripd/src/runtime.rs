//! Component wiring and lifecycle.
//!
//! One bus carries everything. The edge adapter bridges the external web
//! server to the edge ZHTTP leg; the proxy engine serves that leg and
//! opens origin-leg requests; the handler engine adopts accepted sessions
//! and consumes the publish intake. Shutdown stops components in reverse
//! order of data flow.

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use gripd_edge::{EdgeAdapter, EdgeConfig};
use gripd_handler::{HandlerConfig, HandlerEngine};
use gripd_proxy::{ProxyConfig, ProxyEngine, RouteTable};
use gripd_x::bus::Bus;
use gripd_x::stats::StatsConfig;
use gripd_zhttp::EndpointSpec;

use crate::config::ServerConfig;

pub fn init_logging(config: &ServerConfig, logfile: Option<&str>) -> anyhow::Result<()> {
    let level = match config.global.log_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

pub struct App {
    edge_stop: oneshot::Sender<()>,
    proxy_stop: oneshot::Sender<()>,
    handler_stop: oneshot::Sender<()>,
    edge_task: JoinHandle<()>,
    proxy_task: JoinHandle<()>,
    handler_task: JoinHandle<()>,
    pub bus: Bus,
}

impl App {
    pub fn start(config: &ServerConfig) -> anyhow::Result<Self> {
        let bus = Bus::new();
        Self::start_on(config, bus)
    }

    /// Start all components on an existing bus (used by tests that attach
    /// simulated peers).
    pub fn start_on(config: &ServerConfig, bus: Bus) -> anyhow::Result<Self> {
        let instance = &config.global.instance_id;

        let edge_spec = EndpointSpec::new(config.resolve_endpoint(&config.endpoints.edge_base));
        let origin_spec =
            EndpointSpec::new(config.resolve_endpoint(&config.endpoints.origin_base));

        let stats_config = StatsConfig {
            connection_ttl: std::time::Duration::from_secs(config.limits.connection_ttl_secs),
            subscription_ttl: std::time::Duration::from_secs(config.limits.subscription_ttl_secs),
            subscription_linger: std::time::Duration::from_secs(
                config.limits.subscription_linger_secs,
            ),
            report_interval: std::time::Duration::from_secs(config.limits.report_interval_secs),
        };

        let routes = RouteTable::from_lines(config.routes.iter().map(String::as_str))
            .map_err(|e| anyhow::anyhow!("route parse failed: {e}"))?;

        let handler = HandlerEngine::new(
            &bus,
            HandlerConfig {
                instance_id: Bytes::from(format!("{instance}-handler")),
                edge: edge_spec.clone(),
                origin: origin_spec.clone(),
                accept_endpoint: config.resolve_endpoint(&config.endpoints.accept),
                publish_endpoint: config.resolve_endpoint(&config.endpoints.publish),
                wscontrol_in: config.resolve_endpoint(&config.endpoints.wscontrol_in),
                wscontrol_out: config.resolve_endpoint(&config.endpoints.wscontrol_out),
                stats_endpoint: config.resolve_endpoint(&config.endpoints.stats),
            },
            stats_config.clone(),
        )
        .map_err(|e| anyhow::anyhow!("handler start failed: {e}"))?;

        let proxy = ProxyEngine::new(
            &bus,
            ProxyConfig {
                instance_id: Bytes::from(format!("{instance}-proxy")),
                edge: edge_spec.clone(),
                origin: origin_spec,
                accept_endpoint: config.resolve_endpoint(&config.endpoints.accept),
                wscontrol_in: config.resolve_endpoint(&config.endpoints.wscontrol_in),
                wscontrol_out: config.resolve_endpoint(&config.endpoints.wscontrol_out),
                stats_endpoint: config.resolve_endpoint(&config.endpoints.stats),
            },
            routes,
            stats_config,
        )
        .map_err(|e| anyhow::anyhow!("proxy start failed: {e}"))?;

        let edge = EdgeAdapter::new(
            &bus,
            EdgeConfig {
                instance_id: Bytes::from(format!("{instance}-edge")),
                ext_in: config.resolve_endpoint(&config.endpoints.ext_in),
                ext_out: config.resolve_endpoint(&config.endpoints.ext_out),
                ext_control: config.resolve_endpoint(&config.endpoints.ext_control),
                zhttp: edge_spec,
                client_buffer: config.limits.client_buffer,
            },
        )
        .map_err(|e| anyhow::anyhow!("edge start failed: {e}"))?;

        let (handler_stop, handler_stop_rx) = oneshot::channel();
        let (proxy_stop, proxy_stop_rx) = oneshot::channel();
        let (edge_stop, edge_stop_rx) = oneshot::channel();

        let handler_task = tokio::spawn(handler.run(handler_stop_rx));
        let proxy_task = tokio::spawn(proxy.run(proxy_stop_rx));
        let edge_task = tokio::spawn(edge.run(edge_stop_rx));

        Ok(Self {
            edge_stop,
            proxy_stop,
            handler_stop,
            edge_task,
            proxy_task,
            handler_task,
            bus,
        })
    }

    /// Stop components edge-first so in-flight sessions drain toward the
    /// client before their workers go away.
    pub async fn shutdown(self) {
        let _ = self.edge_stop.send(());
        if self.edge_task.await.is_err() {
            warn!("edge adapter ended abnormally");
        }
        let _ = self.proxy_stop.send(());
        if self.proxy_task.await.is_err() {
            warn!("proxy engine ended abnormally");
        }
        let _ = self.handler_stop.send(());
        if self.handler_task.await.is_err() {
            warn!("handler engine ended abnormally");
        }
    }
}
