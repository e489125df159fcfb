#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use peerserve::auth::{create_jwt, Role};
use peerserve::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use peerserve::repo::inmem::InMemRepo;
use peerserve::routes::{config, AppState};
use peerserve::trust::NoopScorer;
use serial_test::serial;
use std::sync::Arc;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("PEERSERVE_DATA_DIR", tmp.path().to_str().unwrap());
}

fn token(user_id: i64) -> String {
    create_jwt(user_id, vec![Role::User]).unwrap()
}

fn state() -> AppState {
    AppState {
        repo: Arc::new(InMemRepo::new()),
        trust: Arc::new(NoopScorer),
        limiter: RateLimiterFacade::new(InMemoryRateLimiter::new(false), RateLimitConfig::from_env()),
    }
}

/// Listing-flow booking between user 1 (client) and user 2 (resolver),
/// confirmed at the given price. Returns the booking id.
macro_rules! confirmed_booking {
    ($app:expr, $price:expr) => {{
        for name in ["client", "resolver"] {
            let req = test::TestRequest::post()
                .uri("/api/v1/users")
                .set_json(serde_json::json!({"username": name}))
                .to_request();
            let resp = test::call_service($app, req).await;
            assert!(resp.status() == 201 || resp.status() == 409); // second booking reuses users
        }
        let req = test::TestRequest::post()
            .uri("/api/v1/listings")
            .insert_header(("Authorization", format!("Bearer {}", token(2))))
            .set_json(serde_json::json!({"title": "T", "description": "D", "price": $price}))
            .to_request();
        let listing: serde_json::Value =
            serde_json::from_slice(&test::read_body(test::call_service($app, req).await).await)
                .unwrap();
        let req = test::TestRequest::post()
            .uri("/api/v1/proposals")
            .insert_header(("Authorization", format!("Bearer {}", token(1))))
            .set_json(serde_json::json!({
                "receiver_id": 2,
                "service_listing_id": listing["id"],
                "service_request_id": null,
                "description": "x",
                "price": $price,
                "start_date": (chrono::Utc::now() + chrono::Duration::days(10)).to_rfc3339(),
                "deadline": null
            }))
            .to_request();
        let sent: serde_json::Value =
            serde_json::from_slice(&test::read_body(test::call_service($app, req).await).await)
                .unwrap();
        let proposal_id = sent["proposal"]["id"].as_i64().unwrap();
        let booking_id = sent["booking"]["id"].as_i64().unwrap();
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/proposals/{proposal_id}/respond"))
            .insert_header(("Authorization", format!("Bearer {}", token(2))))
            .set_json(serde_json::json!({"action": "ACCEPT"}))
            .to_request();
        assert_eq!(test::call_service($app, req).await.status(), 200);
        booking_id
    }};
}

async fn booking_payment_status(
    app: &impl actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
    >,
    booking_id: i64,
) -> String {
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{booking_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let view: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(app, req).await).await).unwrap();
    view["payment_status"].as_str().unwrap().to_string()
}

#[actix_web::test]
#[serial]
async fn a_booking_gets_exactly_one_payment_plan() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app, 100.0);

    // empty plans are rejected
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"milestones": []}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let payload = serde_json::json!({"milestones": [
        {"name": "Deposit", "amount": 40.0, "percentage": 40.0, "due_date": null, "required": true},
        {"name": "Balance", "amount": 60.0, "percentage": 60.0, "due_date": null}
    ]});
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(payload.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let plan: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(plan["milestones"].as_array().unwrap().len(), 2);
    // positions follow submission order
    assert_eq!(plan["milestones"][0]["name"], "Deposit");
    assert_eq!(plan["milestones"][0]["position"].as_i64().unwrap(), 0);
    assert_eq!(plan["milestones"][1]["position"].as_i64().unwrap(), 1);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(payload)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let fetched: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(fetched["milestones"].as_array().unwrap().len(), 2);
}

#[actix_web::test]
#[serial]
async fn logging_sets_the_logger_side_and_milestones_take_one_log() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app, 100.0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"milestones": [
            {"name": "Full amount", "amount": 100.0, "percentage": 100.0, "due_date": null}
        ]}))
        .to_request();
    let plan: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let milestone_id = plan["milestones"][0]["id"].as_i64().unwrap();

    // non-positive amounts rejected
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payments"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"milestone_id": milestone_id, "amount": 0.0, "payment_method": "cash"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // resolver logs: provider side acknowledged at creation, client side open
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payments"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"milestone_id": milestone_id, "amount": 100.0, "payment_method": "cash"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let log: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(log["provider_acknowledged"], true);
    assert!(!log["provider_acknowledged_at"].is_null());
    assert_eq!(log["client_acknowledged"], false);
    assert!(log["client_acknowledged_at"].is_null());

    // one log per milestone
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payments"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"milestone_id": milestone_id, "amount": 100.0, "payment_method": "cash"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    // a single-sided log never counts toward the booking total
    assert_eq!(booking_payment_status(&app, booking_id).await, "PENDING");
}

#[actix_web::test]
#[serial]
async fn dual_acknowledgment_drives_partial_then_paid() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app, 100.0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"milestones": [
            {"name": "Deposit", "amount": 60.0, "percentage": 60.0, "due_date": null},
            {"name": "Balance", "amount": 39.995, "percentage": 40.0, "due_date": null}
        ]}))
        .to_request();
    let plan: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let mut log_ids = Vec::new();
    for m in plan["milestones"].as_array().unwrap() {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/bookings/{booking_id}/payments"))
            .insert_header(("Authorization", format!("Bearer {}", token(2))))
            .set_json(serde_json::json!({
                "milestone_id": m["id"],
                "amount": m["amount"],
                "payment_method": "transfer"
            }))
            .to_request();
        let log: serde_json::Value =
            serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await)
                .unwrap();
        log_ids.push(log["id"].as_i64().unwrap());
    }
    assert_eq!(booking_payment_status(&app, booking_id).await, "PENDING");

    // client acknowledges the deposit: recognized 60 of 100
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/payments/{}/acknowledge", log_ids[0]))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let log: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(log["client_acknowledged"], true);
    assert_eq!(booking_payment_status(&app, booking_id).await, "PARTIAL");

    // the 0.005 shortfall is inside the comparison tolerance
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/payments/{}/acknowledge", log_ids[1]))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    assert_eq!(booking_payment_status(&app, booking_id).await, "PAID");
}

#[actix_web::test]
#[serial]
async fn acknowledging_twice_is_a_no_op() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app, 50.0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"milestones": [
            {"name": "Full", "amount": 50.0, "percentage": 100.0, "due_date": null}
        ]}))
        .to_request();
    let plan: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/payments"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({
            "milestone_id": plan["milestones"][0]["id"],
            "amount": 50.0,
            "payment_method": "cash"
        }))
        .to_request();
    let log: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let log_id = log["id"].as_i64().unwrap();
    // client logged it, so the client side is already set
    assert_eq!(log["client_acknowledged"], true);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/payments/{log_id}/acknowledge"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let after: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    // re-acknowledging the same side keeps the original timestamp
    assert_eq!(after["client_acknowledged_at"], log["client_acknowledged_at"]);
    assert_eq!(after["provider_acknowledged"], false);
}

#[actix_web::test]
#[serial]
async fn milestone_must_belong_to_the_booking() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;
    let first = confirmed_booking!(&app, 100.0);
    let second = confirmed_booking!(&app, 80.0);

    for (booking, amount) in [(first, 100.0), (second, 80.0)] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/bookings/{booking}/payment-plan"))
            .insert_header(("Authorization", format!("Bearer {}", token(1))))
            .set_json(serde_json::json!({"milestones": [
                {"name": "Full", "amount": amount, "percentage": 100.0, "due_date": null}
            ]}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{second}/payment-plan"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let other_plan: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    // logging against the first booking with the second booking's milestone
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{first}/payments"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({
            "milestone_id": other_plan["milestones"][0]["id"],
            "amount": 80.0,
            "payment_method": "cash"
        }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}
