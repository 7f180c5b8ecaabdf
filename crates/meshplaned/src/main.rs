//! meshplaned — mesh overlay supernode daemon.
//!
//! Loads and validates the configuration (any failure exits non-zero),
//! brings up one UDP control device per configured address family, wires
//! the event channels into the dispatcher, starts the ticker fabric and the
//! HTTP pull API, runs the post-start hook, then supervises everything
//! until a signal, a listener error, or a device closing shuts it down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use meshplane_api::ApiState;
use meshplane_core::config::SuperConfig;
use meshplane_core::crypto::Keypair;
use meshplane_services::{event_channels, tickers, AddrFamily, Dispatcher, EdgeDevice, Supernode};

mod ingress;
mod udp_device;

use udp_device::UdpDevice;

/// Inherited API listener descriptor, if the supervisor passes one.
const API_FD_ENV: &str = "MESHPLANE_API_FD";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let arg = std::env::args().nth(1);
    let config_path = match arg.as_deref() {
        Some("--example-config") => {
            print!("{}", toml::to_string_pretty(&SuperConfig::example())?);
            return Ok(());
        }
        Some(path) => PathBuf::from(path),
        None => bail!("usage: meshplaned <config.toml> | meshplaned --example-config"),
    };

    let cfg = SuperConfig::load(&config_path)?;
    cfg.validate()?;
    tracing::info!(node_name = %cfg.node_name, config = %config_path.display(), "starting");

    // One control device per configured family.
    let mut devices: Vec<Arc<dyn EdgeDevice>> = Vec::new();
    let mut listeners: Vec<(Arc<UdpSocket>, Arc<UdpDevice>)> = Vec::new();
    for (family, key) in [
        (AddrFamily::V4, &cfg.priv_key_v4),
        (AddrFamily::V6, &cfg.priv_key_v6),
    ] {
        if key.is_empty() {
            continue;
        }
        let keypair = Keypair::from_base64(key)
            .with_context(|| format!("bad priv_key_{}", family.label()))?;
        let socket = Arc::new(bind_control_socket(family, cfg.listen_port)?);
        tracing::info!(
            family = family.label(),
            port = cfg.listen_port,
            pubkey = %keypair.public.to_base64(),
            "control device up"
        );
        let device = UdpDevice::spawn(family, socket.clone());
        devices.push(device.clone());
        listeners.push((socket, device));
    }
    if devices.is_empty() {
        bail!("no control device enabled: set priv_key_v4 and/or priv_key_v6");
    }

    let api_prefix = cfg.api_prefix.clone();
    let api_port = cfg.api_port;
    let node = Supernode::new(cfg, devices)?;

    let (channels, receivers) = event_channels();
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(8);

    let mut ingress_tasks = Vec::new();
    for (socket, device) in listeners {
        ingress_tasks.push(tokio::spawn(ingress::ingress_loop(
            socket,
            device,
            channels.clone(),
            err_tx.clone(),
        )));
    }

    let dispatcher = tokio::spawn(Dispatcher::new(node.clone(), receivers).run());
    let repush = tokio::spawn(tickers::repush_ticker(node.clone()));
    let timeout = tokio::spawn(tickers::timeout_ticker(node.clone(), channels.clone()));

    let api_listener = api_listener(api_port).await?;
    let api = {
        let state = ApiState { node: node.clone() };
        tokio::spawn(async move { meshplane_api::serve(state, api_listener, &api_prefix).await })
    };

    run_post_script(&node.cfg)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = sigterm.recv() => tracing::info!("terminate received"),
        Some(e) = err_rx.recv() => tracing::error!(error = %e, "control listener failed"),
        result = api => tracing::error!(?result, "API server exited"),
    }

    // Stop the tickers and producers, then let in-flight events drain.
    repush.abort();
    timeout.abort();
    for task in ingress_tasks {
        task.abort();
    }
    drop(channels);
    let _ = tokio::time::timeout(Duration::from_secs(2), dispatcher).await;
    tracing::info!("shut down");
    Ok(())
}

/// Bind a family-specific control socket. The v6 socket is v6-only so both
/// families can share the port on dual-stack hosts.
fn bind_control_socket(family: AddrFamily, port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::SocketAddr;

    let (domain, addr): (Domain, SocketAddr) = match family {
        AddrFamily::V4 => (Domain::IPV4, format!("0.0.0.0:{port}").parse()?),
        AddrFamily::V6 => (Domain::IPV6, format!("[::]:{port}").parse()?),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if matches!(family, AddrFamily::V6) {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind control socket on {addr}"))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Use the inherited listener when the supervisor provides one, otherwise
/// bind fresh.
async fn api_listener(port: u16) -> Result<tokio::net::TcpListener> {
    if let Ok(fd_str) = std::env::var(API_FD_ENV) {
        use std::os::fd::FromRawFd;
        let fd: i32 = fd_str
            .parse()
            .with_context(|| format!("{API_FD_ENV} must be a descriptor number"))?;
        tracing::info!(fd, "adopting inherited API listener");
        // Safety: the supervisor handed us this descriptor; we are its sole
        // owner from here on.
        let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;
        return Ok(tokio::net::TcpListener::from_std(listener)?);
    }
    Ok(tokio::net::TcpListener::bind(("0.0.0.0", port)).await?)
}

/// The post-start hook is a deployment invariant: if it fails, so does the
/// daemon.
fn run_post_script(cfg: &SuperConfig) -> Result<()> {
    if cfg.post_script.is_empty() {
        return Ok(());
    }
    tracing::info!(script = %cfg.post_script, "running post-start hook");
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(&cfg.post_script)
        .env("MESHPLANE_NODE_NAME", &cfg.node_name)
        .output()
        .context("failed to run post_script")?;
    if !output.status.success() {
        bail!(
            "post_script exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::info!(output = %stdout.trim_end(), "post-start hook finished");
    }
    Ok(())
}
