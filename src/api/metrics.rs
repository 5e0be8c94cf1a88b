use axum::{extract::State, response::IntoResponse};

use crate::api::AppState;

/// Prometheus metrics endpoint
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.cache.summary().await;
    let mut body = format!(
        "# HELP appconsole_info AppConsole backend info\n\
         # TYPE appconsole_info gauge\n\
         appconsole_info{{version=\"{}\"}} 1\n\
         # HELP appconsole_cache_synced Whether every cache informer has listed once\n\
         # TYPE appconsole_cache_synced gauge\n\
         appconsole_cache_synced {}\n",
        env!("CARGO_PKG_VERSION"),
        u8::from(summary.synced),
    );

    // Recorded counters and gauges, when a recorder is installed
    if let Some(handle) = &state.metrics {
        body.push_str(&handle.render());
    }

    ([("content-type", "text/plain; version=0.0.4")], body)
}
