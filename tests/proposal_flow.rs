#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use peerserve::auth::{create_jwt, Role};
use peerserve::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use peerserve::repo::inmem::InMemRepo;
use peerserve::repo::ProposalRepo;
use peerserve::routes::{config, AppState};
use peerserve::trust::NoopScorer;
use serial_test::serial;
use std::sync::Arc;

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("PEERSERVE_DATA_DIR", tmp.path().to_str().unwrap());
}

fn token(user_id: i64) -> String {
    create_jwt(user_id, vec![Role::User]).unwrap()
}

fn state_with(repo: Arc<InMemRepo>) -> AppState {
    AppState {
        repo,
        trust: Arc::new(NoopScorer),
        limiter: RateLimiterFacade::new(InMemoryRateLimiter::new(false), RateLimitConfig::from_env()),
    }
}

fn start_date() -> String {
    (chrono::Utc::now() + chrono::Duration::days(10)).to_rfc3339()
}

#[actix_web::test]
#[serial]
async fn listing_flow_creates_booking_and_confirms_on_accept() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    // client + resolver
    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .set_json(serde_json::json!({"username": "alice"}))
        .to_request();
    let client: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let client_id = client["id"].as_i64().unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .set_json(serde_json::json!({"username": "bob", "bio": "I fix things"}))
        .to_request();
    let resolver: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let resolver_id = resolver["id"].as_i64().unwrap();

    // resolver publishes a listing
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", token(resolver_id))))
        .set_json(serde_json::json!({"title": "Math tutoring", "description": "Calc I & II", "price": 80.0}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let listing: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let listing_id = listing["id"].as_i64().unwrap();

    // client proposes against the listing: a draft booking is created with it
    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(client_id))))
        .set_json(serde_json::json!({
            "receiver_id": resolver_id,
            "service_listing_id": listing_id,
            "service_request_id": null,
            "description": "Two sessions a week",
            "price": 80.0,
            "start_date": start_date(),
            "deadline": null
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let sent: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let proposal_id = sent["proposal"]["id"].as_i64().unwrap();
    let booking_id = sent["booking"]["id"].as_i64().unwrap();
    assert_eq!(sent["booking"]["status"], "SERVICE_PROPOSAL_SENT");
    assert_eq!(sent["proposal"]["status"], "PENDING");

    // derived view before confirmation: no step yet
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{booking_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token(client_id))))
        .to_request();
    let view: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(view["kind"], "SERVICE_LISTING");
    assert!(view["current_step_index"].is_null());

    // resolver accepts: proposal terms land on the booking
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{proposal_id}/respond"))
        .insert_header(("Authorization", format!("Bearer {}", token(resolver_id))))
        .set_json(serde_json::json!({"action": "ACCEPT"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let accepted: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(accepted["proposal"]["status"], "ACCEPTED");
    assert_eq!(accepted["booking"]["status"], "CONFIRMED");
    assert_eq!(accepted["booking"]["total_price"].as_f64().unwrap(), 80.0);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{booking_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token(client_id))))
        .to_request();
    let view: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(view["current_step_index"].as_u64().unwrap(), 0);
}

#[actix_web::test]
#[serial]
async fn proposal_context_must_be_unambiguous() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .set_json(serde_json::json!({"username": "alice"}))
        .to_request();
    let user: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let user_id = user["id"].as_i64().unwrap();

    // both contexts set
    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(user_id))))
        .set_json(serde_json::json!({
            "receiver_id": user_id,
            "service_listing_id": 1,
            "service_request_id": 2,
            "description": "x",
            "price": 10.0,
            "start_date": start_date(),
            "deadline": null
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // neither context set
    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(user_id))))
        .set_json(serde_json::json!({
            "receiver_id": user_id,
            "service_listing_id": null,
            "service_request_id": null,
            "description": "x",
            "price": 10.0,
            "start_date": start_date(),
            "deadline": null
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn receiver_must_own_the_context() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    for name in ["alice", "bob", "carol"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/users")
            .set_json(serde_json::json!({"username": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    // bob (2) owns the listing, but the proposal names carol (3) as receiver
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"title": "T", "description": "D", "price": 50.0}))
        .to_request();
    let listing: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({
            "receiver_id": 3,
            "service_listing_id": listing["id"],
            "service_request_id": null,
            "description": "x",
            "price": 50.0,
            "start_date": start_date(),
            "deadline": null
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_web::test]
#[serial]
async fn one_pending_proposal_per_sender_per_request() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    for name in ["client", "resolver"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/users")
            .set_json(serde_json::json!({"username": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/requests")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"title": "Fix my bike", "description": "Flat tire", "budget": 30.0}))
        .to_request();
    let request: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let request_id = request["id"].as_i64().unwrap();

    let payload = serde_json::json!({
        "receiver_id": 1,
        "service_listing_id": null,
        "service_request_id": request_id,
        "description": "Can do tomorrow",
        "price": 25.0,
        "start_date": start_date(),
        "deadline": null
    });
    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(payload.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let sent: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    // request flow proposals have no booking until acceptance
    assert!(sent["booking"].is_null());

    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_web::test]
#[serial]
async fn accepting_a_request_proposal_declines_the_rest() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    for name in ["client", "fast", "slow"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/users")
            .set_json(serde_json::json!({"username": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/requests")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"title": "Move a couch", "description": "3rd floor", "budget": 60.0}))
        .to_request();
    let request: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let request_id = request["id"].as_i64().unwrap();

    let mut proposal_ids = Vec::new();
    for resolver in [2i64, 3] {
        let req = test::TestRequest::post()
            .uri("/api/v1/proposals")
            .insert_header(("Authorization", format!("Bearer {}", token(resolver))))
            .set_json(serde_json::json!({
                "receiver_id": 1,
                "service_listing_id": null,
                "service_request_id": request_id,
                "description": "I can help",
                "price": 55.0,
                "start_date": start_date(),
                "deadline": null
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let sent: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        proposal_ids.push(sent["proposal"]["id"].as_i64().unwrap());
    }

    // client accepts the first bidder
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{}/respond", proposal_ids[0]))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"action": "ACCEPT"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let accepted: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(accepted["booking"]["status"], "CONFIRMED");
    assert_eq!(accepted["booking"]["total_price"].as_f64().unwrap(), 55.0);

    // request assigned to the winner
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/requests/{request_id}"))
        .to_request();
    let request: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(request["status"], "ASSIGNED");
    assert_eq!(request["resolver_id"].as_i64().unwrap(), 2);

    // losing bidder was mass-declined with the standard reason
    let losing = repo.get_proposal(proposal_ids[1]).await.unwrap();
    assert_eq!(
        losing.decline_reason.as_deref(),
        Some("Request was assigned to another resolver")
    );

    // and can no longer be accepted
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{}/respond", proposal_ids[1]))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"action": "ACCEPT"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);
}

#[actix_web::test]
#[serial]
async fn counter_offer_swaps_parties_and_moves_booking_to_negotiating() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    for name in ["client", "resolver"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/users")
            .set_json(serde_json::json!({"username": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"title": "T", "description": "D", "price": 100.0}))
        .to_request();
    let listing: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({
            "receiver_id": 2,
            "service_listing_id": listing["id"],
            "service_request_id": null,
            "description": "Original terms",
            "price": 100.0,
            "start_date": start_date(),
            "deadline": null
        }))
        .to_request();
    let sent: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let original_id = sent["proposal"]["id"].as_i64().unwrap();
    let booking_id = sent["booking"]["id"].as_i64().unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{original_id}/respond"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"action": "COUNTER", "description": "More prep work needed", "price": 130.0}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let countered: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let counter = &countered["proposal"];
    assert_eq!(counter["status"], "PENDING");
    assert_eq!(counter["sender_id"].as_i64().unwrap(), 2);
    assert_eq!(counter["receiver_id"].as_i64().unwrap(), 1);
    // unspecified terms carry forward
    assert_eq!(counter["start_date"], sent["proposal"]["start_date"]);

    let original = repo.get_proposal(original_id).await.unwrap();
    assert_eq!(original.status, peerserve::models::ProposalStatus::Modified);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{booking_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let view: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(view["status"], "NEGOTIATING");
    assert_eq!(view["latest_proposal_id"].as_i64().unwrap(), counter["id"].as_i64().unwrap());

    // client accepts the counter: price 130 lands on the booking
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{}/respond", counter["id"]))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"action": "ACCEPT"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let accepted: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(accepted["booking"]["status"], "CONFIRMED");
    assert_eq!(accepted["booking"]["total_price"].as_f64().unwrap(), 130.0);
}

#[actix_web::test]
#[serial]
async fn decline_requires_a_reason_and_declines_the_booking() {
    setup_env();
    let repo = Arc::new(InMemRepo::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state_with(repo.clone())))
            .configure(config),
    )
    .await;

    for name in ["client", "resolver"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/users")
            .set_json(serde_json::json!({"username": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"title": "T", "description": "D", "price": 10.0}))
        .to_request();
    let listing: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({
            "receiver_id": 2,
            "service_listing_id": listing["id"],
            "service_request_id": null,
            "description": "x",
            "price": 10.0,
            "start_date": start_date(),
            "deadline": null
        }))
        .to_request();
    let sent: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    let proposal_id = sent["proposal"]["id"].as_i64().unwrap();
    let booking_id = sent["booking"]["id"].as_i64().unwrap();

    // sender cannot respond to their own proposal
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{proposal_id}/respond"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"action": "DECLINE", "decline_reason": "nope"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    // missing reason
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{proposal_id}/respond"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"action": "DECLINE"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/proposals/{proposal_id}/respond"))
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(serde_json::json!({"action": "DECLINE", "decline_reason": "Fully booked this month"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let declined: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(declined["proposal"]["status"], "DECLINED");
    assert_eq!(declined["proposal"]["decline_reason"], "Fully booked this month");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/bookings/{booking_id}"))
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .to_request();
    let view: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(view["status"], "DECLINED");
}

#[actix_web::test]
#[serial]
async fn proposal_sending_is_rate_limited() {
    setup_env();
    std::env::set_var("RL_PROPOSAL_LIMIT", "1");
    let repo = Arc::new(InMemRepo::new());
    let state = AppState {
        repo: repo.clone(),
        trust: Arc::new(NoopScorer),
        limiter: RateLimiterFacade::new(InMemoryRateLimiter::new(true), RateLimitConfig::from_env()),
    };
    std::env::remove_var("RL_PROPOSAL_LIMIT");
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state))
            .configure(config),
    )
    .await;

    for name in ["client", "resolver"] {
        let req = test::TestRequest::post()
            .uri("/api/v1/users")
            .set_json(serde_json::json!({"username": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }
    let req = test::TestRequest::post()
        .uri("/api/v1/requests")
        .insert_header(("Authorization", format!("Bearer {}", token(1))))
        .set_json(serde_json::json!({"title": "T", "description": "D", "budget": 10.0}))
        .to_request();
    let request: serde_json::Value =
        serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();

    let payload = serde_json::json!({
        "receiver_id": 1,
        "service_listing_id": null,
        "service_request_id": request["id"],
        "description": "x",
        "price": 10.0,
        "start_date": start_date(),
        "deadline": null
    });
    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(payload.clone())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::post()
        .uri("/api/v1/proposals")
        .insert_header(("Authorization", format!("Bearer {}", token(2))))
        .set_json(payload)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 429);
}
