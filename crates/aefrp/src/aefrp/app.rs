use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::aefrp::{
    admin, config,
    identity::{Acl, Identity},
    logging, net, telemetry,
    tunnel::{
        client::{Client, ClientOptions},
        host::{HostUplink, HostUplinkOptions},
        server::{LocalRoomOptions, RelayServer, ServerOptions},
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let identity = load_identity(&cfg.identity)?;

    tracing::info!(
        config = %resolved.path.display(),
        fingerprint = %identity.fingerprint(),
        relay_enabled = cfg.relay.is_some(),
        host_enabled = cfg.host.is_some(),
        client_enabled = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "aefrp: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Relay.
    let relay = match &cfg.relay {
        None => None,
        Some(rc) => {
            let server = RelayServer::new(
                &identity,
                ServerOptions {
                    name: display_name(&cfg.identity.nickname, "aefrp relay"),
                    motd: rc.motd.clone(),
                    handshake_timeout: rc.handshake_timeout,
                    idle_timeout: rc.idle_timeout,
                    endpoint_whitelist: Acl::whitelist(rc.endpoint_whitelist.iter().copied()),
                    host_whitelist: Acl::whitelist(rc.host_whitelist.iter().copied()),
                },
            )?;
            for rr in &rc.remote_rooms {
                server
                    .add_remote_room(rr.fingerprint, &rr.host_addr, &rr.transport, shutdown_rx.clone())
                    .with_context(|| format!("relay: remote room {}", rr.fingerprint))?;
            }

            let s = server.clone();
            let listen_addr = rc.listen_addr.clone();
            let transport = rc.transport.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { s.listen_and_serve(&listen_addr, &transport, shutdown).await });
            Some(server)
        }
    };

    // Host.
    let host = match &cfg.host {
        None => None,
        Some(hc) => {
            let server = RelayServer::new(
                &identity,
                ServerOptions {
                    name: hc.room_name.clone(),
                    motd: hc.motd.clone(),
                    idle_timeout: hc.idle_timeout,
                    ..ServerOptions::default()
                },
            )?;
            let acl = Acl {
                whitelist: hc.whitelist.values().copied().collect(),
                blacklist: hc.blacklist.iter().copied().collect(),
            };
            server.add_local_room(LocalRoomOptions {
                name: hc.room_name.clone(),
                motd: hc.motd.clone(),
                ports: hc.ports.clone(),
                acl,
            })?;
            tracing::info!(
                room = %hc.room_name,
                fingerprint = %identity.fingerprint(),
                ports = hc.ports.len(),
                whitelist = hc.whitelist.len(),
                "host: room open"
            );

            if !hc.direct_listen.is_empty() {
                let s = server.clone();
                let listen_addr = hc.direct_listen.clone();
                let transport = hc.transport.clone();
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move { s.listen_and_serve(&listen_addr, &transport, shutdown).await });
            }

            if !hc.relay_addr.is_empty() {
                let uplink = HostUplink::new(
                    server.clone(),
                    HostUplinkOptions {
                        transport: hc.transport.clone(),
                        relay_fingerprint: hc.relay_fingerprint,
                        idle_timeout: hc.idle_timeout,
                        ..HostUplinkOptions::new(hc.relay_addr.clone())
                    },
                )?;
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move { uplink.run(shutdown).await });
            }
            Some(server)
        }
    };

    // Client.
    let client = match &cfg.client {
        None => None,
        Some(cc) => {
            let client = Arc::new(Client::new(
                &identity,
                ClientOptions {
                    transport: cc.transport.clone(),
                    relay_fingerprint: cc.relay_fingerprint,
                    name: cfg.identity.nickname.clone(),
                    bind_ip: cc.bind_addr,
                    port_overrides: cc.ports.clone(),
                    dial_timeout: cc.dial_timeout,
                    idle_timeout: cc.idle_timeout,
                    ..ClientOptions::new(cc.server_addr.clone(), cc.room)
                },
            )?);
            let c = client.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { c.run(shutdown).await });
            Some(client)
        }
    };

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            fingerprint: identity.fingerprint(),
            config_path: resolved.path.clone(),
            relay,
            host,
            client,
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
            let _ = shutdown_tx.send(true);
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not finish in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn load_identity(cfg: &config::IdentityConfig) -> anyhow::Result<Identity> {
    if let Some(pem) = &cfg.private_key {
        return Identity::from_pem(pem).context("identity: inline private_key");
    }
    let (identity, generated) = Identity::load_or_generate(&cfg.key_file)?;
    if generated {
        tracing::warn!(
            path = %cfg.key_file.display(),
            fingerprint = %identity.fingerprint(),
            "identity: generated new key"
        );
    }
    Ok(identity)
}

fn display_name(nickname: &str, fallback: &str) -> String {
    if nickname.is_empty() {
        fallback.to_string()
    } else {
        nickname.to_string()
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")
    }
}
