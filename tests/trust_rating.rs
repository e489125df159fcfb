#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use peerserve::auth::{create_jwt, Role};
use peerserve::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use peerserve::repo::inmem::InMemRepo;
use peerserve::routes::{config, AppState};
use peerserve::trust::HttpTrustScorer;
use serial_test::serial;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("PEERSERVE_DATA_DIR", tmp.path().to_str().unwrap());
}

fn token(user_id: i64) -> String {
    create_jwt(user_id, vec![Role::User]).unwrap()
}

fn state_with_scorer(base_url: &str) -> AppState {
    AppState {
        repo: Arc::new(InMemRepo::new()),
        trust: Arc::new(HttpTrustScorer::new(base_url)),
        limiter: RateLimiterFacade::new(InMemoryRateLimiter::new(false), RateLimitConfig::from_env()),
    }
}

async fn trust_rating(
    app: &impl actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
    >,
    user_id: i64,
) -> f64 {
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/users/{user_id}"))
        .to_request();
    let user: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(app, req).await).await).unwrap();
    user["trust_rating"].as_f64().unwrap()
}

/// Confirmed listing-flow booking between user 1 (client) and user 2
/// (resolver). Returns the booking id.
macro_rules! confirmed_booking {
    ($app:expr) => {{
        for name in ["client", "resolver"] {
            let req = test::TestRequest::post()
                .uri("/api/v1/users")
                .set_json(serde_json::json!({"username": name}))
                .to_request();
            assert_eq!(test::call_service($app, req).await.status(), 201);
        }
        let req = test::TestRequest::post()
            .uri("/api/v1/listings")
            .insert_header(("Authorization", format!("Bearer {}", token(2))))
            .set_json(serde_json::json!({"title": "T", "description": "D", "price": 100.0}))
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
                "price": 100.0,
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

#[actix_web::test]
#[serial]
async fn a_review_triggers_a_recalculation_for_the_reviewed_party() {
    setup_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        // the resolver has one 5-star review by the time the scorer is called
        .and(body_partial_json(serde_json::json!({"positiveReviews": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "trustRating": 4.2
        })))
        .mount(&server)
        .await;

    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with_scorer(&server.uri())))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/progress"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"status": "COMPLETED"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/confirm"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"accepted": true}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    assert_eq!(trust_rating(&app, 2).await, 3.0); // starting value

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/reviews"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"rating": 5, "comment": "Great"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    assert!((trust_rating(&app, 2).await - 4.2).abs() < 1e-9);
    // the reviewer's own rating is untouched
    assert_eq!(trust_rating(&app, 1).await, 3.0);
}

#[actix_web::test]
#[serial]
async fn cancelling_applies_the_penalty_to_the_initiator_only() {
    setup_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "trustRating": 4.0
        })))
        .mount(&server)
        .await;

    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with_scorer(&server.uri())))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/cancel"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"reason": "plans changed"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    // initiator: 4.0 * 0.9; counterparty rescored without the penalty
    assert!((trust_rating(&app, 1).await - 3.6).abs() < 1e-9);
    assert!((trust_rating(&app, 2).await - 4.0).abs() < 1e-9);
}

#[actix_web::test]
#[serial]
async fn scorer_output_is_clamped_to_the_rating_scale() {
    setup_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "trustRating": 7.5
        })))
        .mount(&server)
        .await;

    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with_scorer(&server.uri())))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/cancel"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"reason": "overbooked"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    // counterparty would have scored 7.5 raw
    assert_eq!(trust_rating(&app, 1).await, 5.0);
}

#[actix_web::test]
#[serial]
async fn scorer_outage_never_fails_the_request() {
    setup_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with_scorer(&server.uri())))
            .configure(config),
    )
    .await;
    let booking_id = confirmed_booking!(&app);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/progress"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"status": "COMPLETED"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/confirm"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"accepted": true}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    // the review still lands; the rating just keeps its last value
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/bookings/{booking_id}/reviews"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"rating": 5, "comment": "Great"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    assert_eq!(trust_rating(&app, 2).await, 3.0);
}

#[actix_web::test]
#[serial]
async fn approving_a_portfolio_rescores_its_owner() {
    setup_env();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .and(body_partial_json(serde_json::json!({"portfolioCount": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "trustRating": 3.4
        })))
        .mount(&server)
        .await;

    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with_scorer(&server.uri())))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .set_json(serde_json::json!({"username": "maker"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::post()
        .uri("/api/v1/portfolios")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"title": "Ceramics"}))
        .to_request();
    let portfolio: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let admin = create_jwt(1, vec![Role::User, Role::Admin]).unwrap();
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/admin/portfolios/{}/approve", portfolio["id"]))
        .insert_header(("Authorization", format!("Bearer {admin}")))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    assert!((trust_rating(&app, 1).await - 3.4).abs() < 1e-9);
}
