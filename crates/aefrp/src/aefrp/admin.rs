use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::aefrp::{
    identity::Fingerprint,
    telemetry,
    tunnel::{
        client::{Client, ClientSession},
        room::RoomSnapshot,
        server::RelayServer,
    },
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub fingerprint: Fingerprint,
    pub config_path: PathBuf,
    pub relay: Option<Arc<RelayServer>>,
    pub host: Option<Arc<RelayServer>>,
    pub client: Option<Arc<Client>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/rooms", get(rooms))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    fingerprint: Fingerprint,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            fingerprint: st.fingerprint,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

#[derive(Debug, Default, Serialize)]
struct RoomsResponse {
    relay: Vec<RoomSnapshot>,
    relay_connections: usize,
    host: Vec<RoomSnapshot>,
    client: Option<ClientSession>,
}

fn rooms_response(st: &AdminState) -> RoomsResponse {
    let mut out = RoomsResponse::default();
    if let Some(relay) = &st.relay {
        out.relay = relay.rooms_snapshot();
        out.relay_connections = relay.connection_count();
    }
    if let Some(host) = &st.host {
        out.host = host.rooms_snapshot();
    }
    out.client = st
        .client
        .as_ref()
        .and_then(|c| c.session())
        .map(|s| (*s).clone());
    out
}

async fn rooms(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(rooms_response(&st)))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefrp::{
        identity::Identity,
        tunnel::server::{LocalRoomOptions, ServerOptions},
    };
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[tokio::test]
    async fn rooms_lists_local_room() {
        let id = Identity::generate().unwrap();
        let host = RelayServer::new(&id, ServerOptions::default()).unwrap();
        host.add_local_room(LocalRoomOptions {
            name: "lobby".into(),
            ..Default::default()
        })
        .unwrap();

        let st = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            fingerprint: id.fingerprint(),
            config_path: PathBuf::from("aefrp.toml"),
            relay: None,
            host: Some(host),
            client: None,
        };
        let resp = rooms_response(&st);
        assert!(resp.relay.is_empty());
        assert_eq!(resp.host.len(), 1);
        assert_eq!(resp.host[0].name, "lobby");
        assert!(resp.host[0].ready);
        assert!(resp.client.is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["host"][0]["fingerprint"], id.fingerprint().to_string());
    }
}
