use crate::helpers::spawn_app;

#[tokio::test]
async fn health_check_works() {
    let Some(app) = spawn_app().await else { return };

    let resp = reqwest::get(format!("{}/health_check", app.addr))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(resp.content_length(), Some(0));
}
