use salvo::prelude::*;
use serde_json::json;

use crate::web::handlers::{
    command::command,
    health::health_check,
    metrics::metrics,
    transactions::push_transaction,
};
use crate::web::web_state;

/// The homeserver authenticates with `Authorization: Bearer <hs_token>`; older homeservers
/// send `?access_token=` instead.
pub fn homeserver_token_matches(authorization: Option<&str>, access_token: Option<&str>, expected: &str) -> bool {
    let presented = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .or(access_token);
    !expected.is_empty() && presented == Some(expected)
}

#[handler]
pub async fn homeserver_auth(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    let access_token = req.query::<String>("access_token");
    let expected = web_state().matrix.homeserver_token();
    if !homeserver_token_matches(authorization, access_token.as_deref(), expected) {
        res.status_code(StatusCode::FORBIDDEN);
        res.render(Json(json!({
            "errcode": "M_FORBIDDEN",
            "error": "bad homeserver token",
        })));
        ctrl.skip_rest();
    }
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics))
        .push(Router::with_path("mattermost/command").goal(command))
        .push(
            Router::with_path("_matrix/app/v1/transactions/{txn_id}")
                .hoop(homeserver_auth)
                .put(push_transaction),
        )
}
