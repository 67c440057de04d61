use axum::{Json, extract::State};

use crate::state::AppState;

pub async fn server_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ips = local_ip_address::list_afinet_netifas()
        .map(|list| {
            list.into_iter()
                .filter(|(_, ip)| ip.is_ipv4() && !ip.is_loopback())
                .map(|(_, ip)| ip.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Json(serde_json::json!({
        "ips": ips,
        "port": state.settings.server_port,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
