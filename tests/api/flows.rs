use chrono::Utc;
use serde_json::json;

use crate::helpers::spawn_app;
use crate::helpers::TestApp;

async fn seed_welcome_template(app: &TestApp) {
    let resp = app
        .post_json(
            "/api/template/welcome",
            json!({
                "subject": r#"|user| "Welcome, " + user.name"#,
                "html": "<p>Hi <%= user.name %></p>",
            }),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn onboarding_static_flow_sends_one_welcome_email() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;
    seed_welcome_template(&app).await;

    app.post_json(
        "/api/segment/all",
        json!({ "evaluator": "SELECT id FROM users" }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| { rt.send_email("welcome"); }"#,
            "segments": ["all"],
            "behavior": "static",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A" } }),
    )
    .await;

    // first tick sends, second tick finds the flow exhausted
    app.tick().await;
    app.tick().await;

    let emails = app.sent_emails().await;
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0]["To"], json!("a@x.com"));
    assert_eq!(emails[0]["Subject"], json!("Welcome, A"));
    assert!(emails[0]["HtmlBody"].as_str().unwrap().contains("Hi A"));
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("completed")
    );

    // a completed execution is never picked up again
    app.tick().await;
    assert_eq!(app.sent_emails().await.len(), 1);
}

#[tokio::test]
async fn static_campaigns_keep_users_who_stop_matching() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;
    seed_welcome_template(&app).await;

    app.post_json(
        "/api/segment/active",
        json!({
            "evaluator":
                "SELECT id FROM users WHERE JSON_EXTRACT(attributes, '$.active') = true"
        }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| { rt.send_email("welcome"); }"#,
            "segments": ["active"],
            "behavior": "static",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A", "active": true } }),
    )
    .await;
    app.tick().await;
    app.tick().await;
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("completed")
    );

    app.patch_json("/api/user/u1", json!({ "attributes": { "active": false } }))
        .await;

    // out of the segment, still in the campaign
    let segments: serde_json::Value = app
        .get("/api/user/u1/segment")
        .await
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(segments["value"], json!([]));
    let (memberships,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM campaign_memberships WHERE user_id = 'u1' AND campaign_id = 'c'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(memberships, 1);
}

#[tokio::test]
async fn dynamic_campaign_exit_terminates_before_the_second_email() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;
    seed_welcome_template(&app).await;

    app.post_json(
        "/api/segment/active",
        json!({
            "evaluator":
                "SELECT id FROM users WHERE JSON_EXTRACT(attributes, '$.active') = true"
        }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| {
                rt.send_email("welcome");
                rt.wait(#{ seconds: 60 });
                rt.send_email("welcome");
            }"#,
            "segments": ["active"],
            "behavior": "dynamic",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A", "active": true } }),
    )
    .await;

    app.tick().await; // sends the welcome email, due again immediately
    app.tick().await; // reaches the wait, sleeps for 60s
    assert_eq!(app.sent_emails().await.len(), 1);
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("sleeping")
    );

    // the user stops matching before the wait elapses
    app.patch_json("/api/user/u1", json!({ "attributes": { "active": false } }))
        .await;

    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("terminated")
    );
    let (error,): (Option<String>,) =
        sqlx::query_as("SELECT error FROM executions WHERE user_id = 'u1' AND campaign_id = 'c'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert!(error.unwrap().contains("no longer matches"));

    app.tick().await;
    assert_eq!(app.sent_emails().await.len(), 1);
}

#[tokio::test]
async fn wait_commands_sleep_for_the_summed_duration() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;
    seed_welcome_template(&app).await;

    app.post_json(
        "/api/segment/all",
        json!({ "evaluator": "SELECT id FROM users" }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| {
                rt.wait(#{ days: 1, hours: 2 });
                rt.send_email("welcome");
            }"#,
            "segments": ["all"],
            "behavior": "static",
        }),
    )
    .await;
    let before = Utc::now();
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "name": "A" } }),
    )
    .await;

    assert_eq!(app.tick().await, 1);
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("sleeping")
    );
    let (sleep_until,): (chrono::DateTime<Utc>,) = sqlx::query_as(
        "SELECT sleep_until FROM executions WHERE user_id = 'u1' AND campaign_id = 'c'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    let expected = before + chrono::Duration::hours(26);
    assert!(sleep_until >= expected - chrono::Duration::minutes(1));
    assert!(sleep_until <= expected + chrono::Duration::minutes(1));

    // not due, so nothing advances and no email goes out
    assert_eq!(app.tick().await, 0);
    assert!(app.sent_emails().await.is_empty());
}

#[tokio::test]
async fn attribute_writes_from_the_flow_are_persisted() {
    let Some(app) = spawn_app().await else { return };
    app.configure_postmark().await;

    app.post_json(
        "/api/segment/all",
        json!({ "evaluator": "SELECT id FROM users" }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| {
                ctx.attributes.stage = "waiting";
                rt.wait(#{ days: 1 });
            }"#,
            "segments": ["all"],
            "behavior": "static",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com", "stage": "new" } }),
    )
    .await;

    app.tick().await;
    let user: serde_json::Value = app
        .get("/api/user/u1")
        .await
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(user["value"]["stage"], json!("waiting"));
}

#[tokio::test]
async fn a_throwing_flow_fails_its_execution() {
    let Some(app) = spawn_app().await else { return };

    app.post_json(
        "/api/segment/all",
        json!({ "evaluator": "SELECT id FROM users" }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| { throw "broken flow"; }"#,
            "segments": ["all"],
            "behavior": "static",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com" } }),
    )
    .await;

    app.tick().await;
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("failed")
    );
}

#[tokio::test]
async fn sms_commands_are_rejected() {
    let Some(app) = spawn_app().await else { return };

    app.post_json(
        "/api/segment/all",
        json!({ "evaluator": "SELECT id FROM users" }),
    )
    .await;
    app.post_json(
        "/api/campaign/c",
        json!({
            "flow": r#"|ctx, rt| { rt.send_sms("hi"); }"#,
            "segments": ["all"],
            "behavior": "static",
        }),
    )
    .await;
    app.post_json(
        "/api/user/u1",
        json!({ "attributes": { "email": "a@x.com" } }),
    )
    .await;

    app.tick().await;
    assert_eq!(
        app.execution_status("u1", "c").await.as_deref(),
        Some("failed")
    );
    let (error,): (Option<String>,) =
        sqlx::query_as("SELECT error FROM executions WHERE user_id = 'u1' AND campaign_id = 'c'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert!(error.unwrap().contains("not implemented"));
}
