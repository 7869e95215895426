use chrono::{NaiveDate, TimeZone, Utc};
use repo_cron::bigquery::{BigQueryWarehouse, TableRef};
use repo_cron::webhook::HttpWebhook;
use repo_cron_core::contract::{LoadRequest, Warehouse, Webhook};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn warehouse(server: &MockServer) -> BigQueryWarehouse {
    BigQueryWarehouse::new(
        reqwest::Client::new(),
        server.uri(),
        None,
        TableRef {
            project_id: "proj".into(),
            dataset: "analytics".into(),
            table: "repos".into(),
        },
    )
    .with_poll_interval(Duration::from_millis(10))
}

fn load_request() -> LoadRequest {
    LoadRequest {
        source_uri: "gs://results/2024.01.02/150405/shard-*".into(),
        partition: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        job_time: Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 5).unwrap(),
    }
}

#[tokio::test]
async fn test_load_job_targets_partition_and_polls_until_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/jobs"))
        .and(body_partial_json(json!({
            "configuration": { "load": {
                "sourceUris": ["gs://results/2024.01.02/150405/shard-*"],
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_TRUNCATE",
                "destinationTable": { "projectId": "proj", "datasetId": "analytics", "tableId": "repos$20240102" }
            }}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobReference": { "projectId": "proj", "jobId": "job-1", "location": "EU" },
            "status": { "state": "RUNNING" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects/proj/jobs/job-1"))
        .and(query_param("location", "EU"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobReference": { "projectId": "proj", "jobId": "job-1", "location": "EU" },
            "status": { "state": "DONE" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    warehouse(&server)
        .load_partition(load_request())
        .await
        .expect("load should succeed");
}

#[tokio::test]
async fn test_load_job_error_result_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobReference": { "projectId": "proj", "jobId": "job-2" },
            "status": { "state": "DONE", "errorResult": { "reason": "invalid", "message": "bad row" } }
        })))
        .mount(&server)
        .await;

    let err = warehouse(&server)
        .load_partition(load_request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad row"), "{err}");
}

#[tokio::test]
async fn test_load_job_stuck_running_fails_after_max_wait() {
    let server = MockServer::start().await;
    let running = json!({
        "jobReference": { "projectId": "proj", "jobId": "job-3" },
        "status": { "state": "RUNNING" }
    });
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(running.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects/proj/jobs/job-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(running))
        .mount(&server)
        .await;

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        warehouse(&server)
            .with_max_wait(Duration::from_millis(100))
            .load_partition(load_request()),
    )
    .await
    .expect("polling must give up")
    .unwrap_err();
    assert!(err.to_string().contains("job-3 still RUNNING"), "{err}");
}

#[tokio::test]
async fn test_api_error_status_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/jobs"))
        .respond_with(ResponseTemplate::new(403).set_body_string("access denied"))
        .mount(&server)
        .await;

    let err = warehouse(&server)
        .load_partition(load_request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("403"), "{err}");
}

#[tokio::test]
async fn test_webhook_posts_metadata_bytes() {
    let server = MockServer::start().await;
    let payload = br#"{"num_shard":3,"shard_loc":"gs://results/2024.01.02/150405/","commit_sha":"v1"}"#;
    Mock::given(method("POST"))
        .and(path("/hooks/loaded"))
        .and(header("content-type", "application/json"))
        .and(body_string(String::from_utf8_lossy(payload).to_string()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let webhook = HttpWebhook::new(reqwest::Client::new(), format!("{}/hooks/loaded", server.uri()));
    webhook.notify(payload.to_vec()).await.expect("webhook should succeed");

    let failing = HttpWebhook::new(reqwest::Client::new(), format!("{}/hooks/missing", server.uri()));
    assert!(failing.notify(payload.to_vec()).await.is_err());
}
