use serde_json::json;

use crate::helpers::envelope_value;
use crate::helpers::spawn_app;

#[tokio::test]
async fn api_requests_need_the_bearer_token() {
    let Some(app) = spawn_app().await else { return };

    let resp = reqwest::Client::new()
        .post(format!("{}/api/user/u1", app.addr))
        .json(&json!({ "attributes": { "email": "a@x.com" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = reqwest::Client::new()
        .post(format!("{}/api/user/u1", app.addr))
        .bearer_auth("wrong-key")
        .json(&json!({ "attributes": { "email": "a@x.com" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn user_creation_requires_an_email_attribute() {
    let Some(app) = spawn_app().await else { return };

    let resp = app
        .post_json("/api/user/u1", json!({ "attributes": { "name": "A" } }))
        .await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("email"));
}

#[tokio::test]
async fn user_crud_round_trip() {
    let Some(app) = spawn_app().await else { return };

    let resp = app
        .post_json(
            "/api/user/u1",
            json!({ "attributes": { "email": "a@x.com", "name": "A" } }),
        )
        .await;
    let created = envelope_value(resp).await;
    assert_eq!(created["name"], json!("A"));

    // shallow merge keeps untouched keys
    let resp = app
        .patch_json("/api/user/u1", json!({ "attributes": { "plan": "pro" } }))
        .await;
    let merged = envelope_value(resp).await;
    assert_eq!(merged["name"], json!("A"));
    assert_eq!(merged["plan"], json!("pro"));

    let fetched = envelope_value(app.get("/api/user/u1").await).await;
    assert_eq!(fetched["plan"], json!("pro"));

    let resp = app.delete("/api/user/u1").await;
    assert_eq!(resp.status().as_u16(), 200);
    let resp = app.get("/api/user/u1").await;
    assert_eq!(resp.status().as_u16(), 500);
}

#[tokio::test]
async fn users_land_in_matching_segments() {
    let Some(app) = spawn_app().await else { return };

    let resp = app
        .post_json(
            "/api/segment/all",
            json!({ "evaluator": "SELECT id FROM users" }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com" } }),
    )
    .await;

    let segments = envelope_value(app.get("/api/user/u1/segment").await).await;
    assert_eq!(segments, json!(["all"]));
    let members = envelope_value(app.get("/api/segment/all/user").await).await;
    assert_eq!(members, json!(["u1"]));
}

#[tokio::test]
async fn event_ingestion_flips_triggered_segment_membership() {
    let Some(app) = spawn_app().await else { return };

    let resp = app
        .post_json(
            "/api/segment/purchasers",
            json!({
                "evaluator":
                    "SELECT DISTINCT user_id AS id FROM events WHERE events.name = 'purchase'"
            }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com" } }),
    )
    .await;
    let segments = envelope_value(app.get("/api/user/u1/segment").await).await;
    assert_eq!(segments, json!([]));

    let resp = app
        .post_json(
            "/api/user/u1/event/purchase",
            json!({ "attributes": { "amount": 5 } }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let segments = envelope_value(app.get("/api/user/u1/segment").await).await;
    assert_eq!(segments, json!(["purchasers"]));

    let events = envelope_value(app.get("/api/user/u1/event").await).await;
    assert_eq!(events.as_array().unwrap().len(), 1);
    assert_eq!(events[0]["name"], json!("purchase"));
}

#[tokio::test]
async fn referenced_segments_cannot_be_deleted() {
    let Some(app) = spawn_app().await else { return };

    app.post_json(
        "/api/segment/all",
        json!({ "evaluator": "SELECT id FROM users" }),
    )
    .await;
    let resp = app
        .post_json(
            "/api/campaign/c",
            json!({
                "flow": "|ctx, rt| {}",
                "segments": ["all"],
                "behavior": "static",
            }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let resp = app.delete("/api/segment/all").await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("referenced"));

    // drop the campaign and the segment goes with no complaint
    app.delete("/api/campaign/c").await;
    let resp = app.delete("/api/segment/all").await;
    assert_eq!(resp.status().as_u16(), 200);
}
