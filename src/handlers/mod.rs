pub mod config;
pub mod models;
pub mod transcribe;

pub use config::*;
pub use models::*;
pub use transcribe::*;

use crate::error::{AppError, AppResult};
use actix_web::{HttpRequest, HttpResponse};

/// Fallback for unknown routes, so they get the JSON error envelope too.
pub async fn route_not_found(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::NotFound(format!(
        "No route for {} {}",
        req.method(),
        req.path()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, web, App};

    #[actix_web::test]
    async fn test_unknown_route_uses_error_envelope() {
        let app = test::init_service(
            App::new()
                .route("/health", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .default_service(web::to(route_not_found)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let json: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(json["error"]["type"], "not_found");
        assert!(json["error"]["message"].as_str().unwrap().contains("/api/v1/nope"));
    }
}
