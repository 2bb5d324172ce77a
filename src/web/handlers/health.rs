use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    let state = web_state();
    res.render(Json(json!({
        "status": "ok",
        "mode": state.config.mattermost.mode.to_string(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    })));
}
