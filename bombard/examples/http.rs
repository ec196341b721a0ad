use std::sync::Arc;

use bombard::{
    Bombardier, Campaign, HttpTransport, RequestTemplate, RunArgs, StdoutSink,
    report::ReportSink, template::Headers,
};
use serde_json::json;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    // Log in once, then hammer the profile endpoint with the token we got back.
    let campaign = Campaign::default()
        .with_supply("host", json!("http://localhost:3000"))
        .with_prepare(
            "login",
            RequestTemplate::builder()
                .url("{host}/login")
                .method("POST")
                .headers(Headers::Preset("json".into()))
                .body(json!({"user": "demo", "password": "demo"}))
                .extract(serde_json::from_value(json!({"token": "auth.token"})).unwrap())
                .reload("profile".to_string())
                .build(),
        )
        .with_ammo(
            "profile",
            RequestTemplate::builder()
                .url("{host}/me")
                .name("profile")
                .headers(Headers::List(vec![(
                    "Authorization".into(),
                    "Bearer {token}".into(),
                )]))
                .repeat(100)
                .build(),
        );

    let engine = Arc::new(
        Bombardier::builder()
            .args(RunArgs {
                workers: 20,
                ..Default::default()
            })
            .campaign(Arc::new(campaign))
            .transport(Arc::new(HttpTransport::default()))
            .build(),
    );

    engine.fire_campaign();
    let summary = engine.bombard().await.unwrap();
    StdoutSink.emit(&summary).await.unwrap();
}
