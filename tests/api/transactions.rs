use serde_json::json;

use crate::helpers::spawn_app;

#[tokio::test]
async fn purchase_events_send_the_matching_transactional_email() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;

    let resp = app
        .post_json(
            "/api/transaction/purchase-receipt",
            json!({
                "event": "purchase",
                "subject": r#"|user, event| "Order " + event.id"#,
                "html": "<%= user.name %>: $<%= event.amount %>",
            }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "e@x.com", "name": "N" } }),
    )
    .await;
    let resp = app
        .post_json(
            "/api/user/u1/event/purchase",
            json!({ "attributes": { "id": "o1", "amount": 42 } }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let emails = app.sent_emails().await;
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0]["To"], json!("e@x.com"));
    assert_eq!(emails[0]["Subject"], json!("Order o1"));
    assert!(emails[0]["HtmlBody"].as_str().unwrap().contains("N: $42"));
}

#[tokio::test]
async fn events_without_a_matching_transaction_send_nothing() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;

    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "e@x.com" } }),
    )
    .await;
    let resp = app
        .post_json("/api/user/u1/event/login", json!({ "attributes": {} }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
    assert!(app.sent_emails().await.is_empty());
}

#[tokio::test]
async fn a_missing_provider_does_not_fail_event_ingestion() {
    let Some(app) = spawn_app().await else { return };
    // no provider configured at all

    app.post_json(
        "/api/transaction/receipt",
        json!({
            "event": "purchase",
            "subject": r#"|user, event| "Order""#,
            "html": "ok",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "e@x.com" } }),
    )
    .await;

    // dispatch fails internally, is logged, and the event still lands
    let resp = app
        .post_json("/api/user/u1/event/purchase", json!({ "attributes": {} }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let events: serde_json::Value = app
        .get("/api/user/u1/event")
        .await
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(events["value"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn transaction_crud_round_trip() {
    let Some(app) = spawn_app().await else { return };

    app.post_json(
        "/api/transaction/receipt",
        json!({
            "event": "purchase",
            "subject": r#"|user, event| "Order""#,
            "html": "ok",
        }),
    )
    .await;
    let resp = app
        .patch_json(
            "/api/transaction/receipt",
            json!({
                "event": "refund",
                "subject": r#"|user, event| "Refund""#,
                "html": "ok",
            }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let listed: serde_json::Value = app
        .get("/api/transaction")
        .await
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(listed["value"][0]["event"], json!("refund"));

    let resp = app.delete("/api/transaction/receipt").await;
    assert_eq!(resp.status().as_u16(), 200);
    let resp = app.get("/api/transaction/receipt").await;
    assert_eq!(resp.status().as_u16(), 500);
}
