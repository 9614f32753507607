use serde_json::json;
use serde_json::Value;

use crate::helpers::envelope_value;
use crate::helpers::spawn_app;

fn full_config() -> Value {
    json!({
        "templates": {
            "welcome": {
                "subject": r#"|user| "Welcome, " + user.name"#,
                "html": "<p>Hi <%= user.name %></p>",
            },
        },
        "segments": {
            "all": { "evaluator": "SELECT id FROM users" },
        },
        "campaigns": {
            "c": {
                "flow": r#"|ctx, rt| { rt.send_email("welcome"); }"#,
                "segments": ["all"],
                "behavior": "static",
            },
        },
        "transactions": {},
        "emailProvider": {
            "config": { "name": "postmark", "apiKey": "test-token" },
            "fromAddress": "no-reply@segflow.test",
        },
    })
}

async fn configs_count(pool: &sqlx::MySqlPool) -> i64 {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM configs")
        .fetch_one(pool)
        .await
        .unwrap();
    n
}

#[tokio::test]
async fn a_push_applies_entities_and_enrolls_matching_users() {
    let Some(app) = spawn_app().await else { return };

    // a user who exists before the push gets picked up by the new campaign
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A" } }),
    )
    .await;

    let value = envelope_value(app.post_json("/api/config", full_config()).await).await;
    assert_eq!(value["configId"], json!(1));

    let segments = envelope_value(app.get("/api/user/u1/segment").await).await;
    assert_eq!(segments, json!(["all"]));
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("pending")
    );
    assert_eq!(configs_count(&app.pool).await, 1);
}

#[tokio::test]
async fn an_identical_push_is_a_no_op() {
    let Some(app) = spawn_app().await else { return };

    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A" } }),
    )
    .await;
    envelope_value(app.post_json("/api/config", full_config()).await).await;

    let value = envelope_value(app.post_json("/api/config", full_config()).await).await;
    assert_eq!(value, json!("no changes"));
    assert_eq!(configs_count(&app.pool).await, 1);

    // in particular, no duplicate executions were created
    let (executions,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM executions WHERE campaign_id = 'c'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(executions, 1);
}

#[tokio::test]
async fn removing_a_campaign_terminates_and_drops_its_executions() {
    let Some(app) = spawn_app().await else { return };

    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A" } }),
    )
    .await;
    envelope_value(app.post_json("/api/config", full_config()).await).await;
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("pending")
    );

    let mut without_campaign = full_config();
    without_campaign["campaigns"] = json!({});
    let value = envelope_value(app.post_json("/api/config", without_campaign).await).await;
    assert_eq!(value["configId"], json!(2));

    assert_eq!(app.execution_status("u1", "c").await, None);
    let (memberships,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM campaign_memberships WHERE campaign_id = 'c'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(memberships, 0);
    let campaigns = envelope_value(app.get("/api/campaign").await).await;
    assert_eq!(campaigns, json!([]));
}

#[tokio::test]
async fn campaign_updates_are_rejected() {
    let Some(app) = spawn_app().await else { return };

    envelope_value(app.post_json("/api/config", full_config()).await).await;

    let mut changed = full_config();
    changed["campaigns"]["c"]["flow"] = json!("|ctx, rt| { rt.wait(#{ days: 1 }); }");
    let resp = app.post_json("/api/config", changed).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not supported"));

    // the rejected push left no ledger row behind
    assert_eq!(configs_count(&app.pool).await, 1);
}

#[tokio::test]
async fn pushes_with_dangling_references_are_rejected() {
    let Some(app) = spawn_app().await else { return };

    let mut config = full_config();
    config["segments"] = json!({});
    let resp = app.post_json("/api/config", config).await;
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(configs_count(&app.pool).await, 0);
}

#[tokio::test]
async fn the_ledger_keeps_every_accepted_configuration() {
    let Some(app) = spawn_app().await else { return };

    envelope_value(app.post_json("/api/config", full_config()).await).await;
    let mut second = full_config();
    second["templates"]["welcome"]["html"] = json!("<p>Hello <%= user.name %></p>");
    let value = envelope_value(app.post_json("/api/config", second).await).await;
    assert_eq!(value["configId"], json!(2));
    assert_eq!(configs_count(&app.pool).await, 2);
}
