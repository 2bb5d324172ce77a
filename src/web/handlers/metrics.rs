use salvo::prelude::*;

use crate::web::metrics::format_prometheus;

#[handler]
pub async fn metrics(res: &mut Response) {
    res.render(Text::Plain(format_prometheus()));
}
