use salvo::prelude::*;
use serde_json::json;

pub use crate::web::web_state;

pub mod command;
pub mod health;
pub mod metrics;
pub mod transactions;

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}
