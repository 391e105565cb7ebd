use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::info;
use std::sync::Arc;

use crate::state::StateStore;

async fn status(store: web::Data<Arc<StateStore>>) -> impl Responder {
    return HttpResponse::Ok().json(serde_json::json!({ "meters": store.snapshot() }));
}

/// Builds the status server. The caller drives the returned future and keeps
/// the server handle for a graceful stop; in-flight requests get at most 5
/// seconds to drain.
pub fn status_server(store: Arc<StateStore>, port: u16) -> std::io::Result<Server> {
    info!("HTTP status endpoint listening on port {port}");

    let data = web::Data::new(store);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::get().to(status))
    })
    .bind(("0.0.0.0", port))?
    .shutdown_timeout(5)
    .run();

    return Ok(server);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Reading;
    use actix_web::test;
    use chrono::Utc;

    fn reading(value: f64, unit: &str, obis: &str) -> Reading {
        Reading {
            value,
            unit: unit.to_string(),
            obis: obis.to_string(),
            metered_at: Utc::now(),
        }
    }

    async fn request_snapshot(store: Arc<StateStore>) -> serde_json::Value {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(store))
                .route("/", web::get().to(status)),
        )
        .await;

        let req = test::TestRequest::get().uri("/").to_request();
        test::call_and_read_body_json(&app, req).await
    }

    #[actix_web::test]
    async fn test_status_endpoint_shape() {
        let store = Arc::new(StateStore::new());
        store.register_meter("haus", "/dev/ttyUSB0");
        store.register_meter("garten", "/dev/ttyUSB1");
        store.update_value("haus", "Bezug", &reading(8782.4, "kWh", "1-0:1.8.0"));
        store.update_value("garten", "Bezug", &reading(17271.4, "kWh", "1-0:1.8.0"));

        let body = request_snapshot(store).await;
        let meters = body["meters"].as_object().unwrap();
        assert_eq!(meters.len(), 2);

        assert_eq!(meters["haus"]["device"], "/dev/ttyUSB0");
        assert_eq!(meters["haus"]["values"]["Bezug"]["value"], 8782.4);
        assert_eq!(meters["haus"]["values"]["Bezug"]["unit"], "kWh");
        assert_eq!(meters["haus"]["values"]["Bezug"]["obis"], "1-0:1.8.0");
        assert!(meters["haus"]["last_update"].is_string());

        assert_eq!(meters["garten"]["device"], "/dev/ttyUSB1");
        assert_eq!(meters["garten"]["values"]["Bezug"]["value"], 17271.4);
    }

    #[actix_web::test]
    async fn test_registered_meter_without_readings() {
        let store = Arc::new(StateStore::new());
        store.register_meter("haus", "/dev/ttyUSB0");

        let body = request_snapshot(store).await;
        let haus = &body["meters"]["haus"];
        assert!(haus["last_update"].is_null());
        assert!(haus["values"].as_object().unwrap().is_empty());
    }
}
