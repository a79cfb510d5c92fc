use std::{io, net::TcpListener, time::Duration};

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use threatdbx::{config::Config, server};
use tokio::{task::JoinHandle, time::sleep};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

// 2026-08-01T12:00:00Z
const DAY_ONE_NOON_MS: i64 = 1_785_585_600_000;

fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn spawn_server(config: Config) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = server::run(config).await {
            eprintln!("test server exited: {err}");
        }
    })
}

async fn wait_for_health(base_url: &str) -> TestResult<()> {
    let client = Client::new();
    for _ in 0..50 {
        if let Ok(response) = client.get(format!("{base_url}/health")).send().await {
            if response.status().is_success() {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    Err("server did not become healthy".into())
}

fn sample_event(event_id: &str) -> Value {
    json!({
        "type": "rule.triggered",
        "eventId": event_id,
        "installId": "install-1",
        "sessionId": "sess-1",
        "severity": "HIGH",
        "ruleId": "rule.phish",
        "rulesetId": "pack-1",
        "scoreDelta": 3.5,
        "timestampMs": DAY_ONE_NOON_MS,
        "origin": "ext-a",
        "page": "https://news.example.com/story",
        "userAgent": "sensor/1.0",
        "payload": {"matched": ["iframe", "redirect"]}
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn ingest_and_query_round_trip() -> TestResult<()> {
    let temp = TempDir::new()?;
    let mut config = Config::default();
    config.data_dir = temp.path().join("data");
    config.port = match allocate_port() {
        Ok(port) => port,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            eprintln!("skipping ingest API test: port binding not permitted ({err})");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    config.ensure_data_dirs()?;

    // One rulepack for the display join.
    std::fs::write(
        config.rulepack_dir().join("pack-1.json"),
        json!({
            "rules": [{
                "id": "rule.phish",
                "title": "Phishing page",
                "oneLine": "A known phishing page was blocked"
            }]
        })
        .to_string(),
    )?;

    let _server = spawn_server(config.clone());
    let base_url = format!("http://127.0.0.1:{}", config.port);
    wait_for_health(&base_url).await?;
    let client = Client::new();

    // First ingest stores the event.
    let response = client
        .post(format!("{base_url}/v1/events"))
        .json(&sample_event("evt-1"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["eventId"], json!("evt-1"));
    assert!(body.get("dedup").is_none());

    // Retrying the same event id is acknowledged as a duplicate.
    let response = client
        .post(format!("{base_url}/v1/events"))
        .json(&sample_event("evt-1"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["dedup"], json!(true));

    // Direct lookup resolves through the pointer catalog.
    let response = client
        .get(format!("{base_url}/v1/event/evt-1"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["event"]["domain"], json!("example.com"));
    assert_eq!(body["event"]["day"], json!("2026-08-01"));
    assert_eq!(body["event"]["display"]["title"], json!("Phishing page"));

    // Day-range listing returns it exactly once, with the display join.
    let response = client
        .get(format!(
            "{base_url}/v1/events?startDay=2026-08-01&endDay=2026-08-01"
        ))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    let items = body["items"].as_array().expect("items array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["eventId"], json!("evt-1"));
    assert_eq!(body["cursor"], Value::Null);

    // Facet listing by severity.
    let response = client
        .get(format!(
            "{base_url}/v1/events/severity/HIGH?startDay=2026-08-01&endDay=2026-08-01&newest=true"
        ))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["items"].as_array().expect("items").len(), 1);

    // Aggregate stats for the day.
    let response = client
        .get(format!(
            "{base_url}/v1/stats/global-domain?day=2026-08-01"
        ))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["totals"]["example.com"]["count"], json!(1));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ingest_rejections_use_wire_error_codes() -> TestResult<()> {
    let temp = TempDir::new()?;
    let mut config = Config::default();
    config.data_dir = temp.path().join("data");
    config.max_request_bytes = 1024;
    config.port = match allocate_port() {
        Ok(port) => port,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            eprintln!("skipping ingest API test: port binding not permitted ({err})");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    config.ensure_data_dirs()?;

    let _server = spawn_server(config.clone());
    let base_url = format!("http://127.0.0.1:{}", config.port);
    wait_for_health(&base_url).await?;
    let client = Client::new();

    // Missing required field.
    let mut event = sample_event("evt-missing");
    event.as_object_mut().expect("object").remove("installId");
    let response = client
        .post(format!("{base_url}/v1/events"))
        .json(&event)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error"], json!("MISSING_REQUIRED_FIELD"));

    // Unparseable body.
    let response = client
        .post(format!("{base_url}/v1/events"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], json!("INVALID_JSON"));

    // Raw body over the request budget.
    let response = client
        .post(format!("{base_url}/v1/events"))
        .header("content-type", "application/json")
        .body("x".repeat(2048))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], json!("PAYLOAD_TOO_LARGE"));

    // A multi-megabyte body gets the same JSON contract, not a bare
    // framework rejection.
    let response = client
        .post(format!("{base_url}/v1/events"))
        .header("content-type", "application/json")
        .body("x".repeat(3 * 1024 * 1024))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json().await?;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error"], json!("PAYLOAD_TOO_LARGE"));

    // Key fields carrying separator bytes are rejected, not stored.
    let mut event = sample_event("evt-forged");
    event["installId"] = json!("victim\u{1F}2026-08-02");
    let response = client
        .post(format!("{base_url}/v1/events"))
        .json(&event)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], json!("INVALID_FIELD_VALUE"));

    // Unknown facet name.
    let response = client
        .get(format!(
            "{base_url}/v1/events/color/blue?startDay=2026-08-01&endDay=2026-08-01"
        ))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Inverted day range.
    let response = client
        .get(format!(
            "{base_url}/v1/events?startDay=2026-08-02&endDay=2026-08-01"
        ))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], json!("INVALID_DAY_RANGE"));

    // Unknown event id.
    let response = client
        .get(format!("{base_url}/v1/event/evt-nope"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}
