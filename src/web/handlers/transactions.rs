use salvo::prelude::*;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::web::handlers::render_error;
use crate::web::web_state;

/// `PUT /_matrix/app/v1/transactions/{txn_id}`
#[handler]
pub async fn push_transaction(req: &mut Request, res: &mut Response) {
    let Some(txn_id) = req.param::<String>("txn_id") else {
        render_error(res, StatusCode::BAD_REQUEST, "missing transaction id");
        return;
    };
    let body = match req.parse_json::<Value>().await {
        Ok(body) => body,
        Err(err) => {
            debug!(txn_id, error = %err, "unreadable transaction body");
            render_error(res, StatusCode::BAD_REQUEST, "invalid json");
            return;
        }
    };

    if let Err(err) = web_state().matrix.handle_transaction(&txn_id, &body).await {
        error!(txn_id, error = %err, "transaction failed");
        render_error(res, StatusCode::INTERNAL_SERVER_ERROR, "transaction failed");
        return;
    }
    res.render(Json(json!({})));
}
