//! End-to-end pipeline tests: provider settings in, deltas out.

use std::time::Duration;

use serde_json::json;
use signalk_core::config::ProviderConfig;
use signalk_core::Delta;
use signalk_providers::nmea0183::checksum;
use signalk_providers::{AppEvent, AppHandle, Pipeline, PipelineContext, ProviderError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn sentence(body: &str) -> String {
    format!("${}*{:02X}", body, checksum(body))
}

/// Collect every delta until the pipeline's app handles are gone.
async fn deltas(mut events: mpsc::Receiver<AppEvent>) -> Vec<(String, Delta)> {
    let mut deltas = Vec::new();
    while let Some(event) = events.recv().await {
        if let AppEvent::Delta { provider_id, delta } = event {
            deltas.push((provider_id, delta));
        }
    }
    deltas
}

async fn next_delta(events: &mut mpsc::Receiver<AppEvent>) -> Delta {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(AppEvent::Delta { delta, .. })) => return delta,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("pipeline gone"),
            Err(_) => panic!("no delta within 5s"),
        }
    }
}

#[tokio::test]
async fn test_bad_settings_fail_before_io() {
    let (app, _events) = AppHandle::channel(16);
    let ctx = PipelineContext::new(app);

    let unknown = ProviderConfig::new("p", "pigeon", "NMEA0183", json!({}));
    assert!(matches!(
        Pipeline::from_provider(&unknown, &ctx),
        Err(ProviderError::Configuration(_))
    ));

    let missing = ProviderConfig::new("p", "filestream", "NMEA0183", json!({}));
    assert!(matches!(
        Pipeline::from_provider(&missing, &ctx),
        Err(ProviderError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_multiplexed_log_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("skserver-raw.log");
    let delta = r#"{"context":"vessels.self","updates":[{"source":{"label":"gps","type":"NMEA0183"},"values":[{"path":"navigation.speedOverGround","value":3.2}]}]}"#;
    let hello = r#"{"name":"x","version":"1.7.0","self":"vessels.self","roles":[]}"#;
    let contents = [
        format!("1700000000000;I;{}", delta),
        format!("1700000000500;I;{}", hello),
        format!("1700000001000;N;{}", sentence("GPHDT,90.0,T")),
        "1700000001500;X;dropped".to_string(),
    ]
    .join("\n");
    std::fs::write(&path, contents).unwrap();

    let (app, events) = AppHandle::channel(64);
    let mut config = ProviderConfig::new(
        "replay",
        "filestream",
        "Multiplexed",
        json!({"filename": path.to_str().unwrap()}),
    );
    config.no_throttle = true;
    let pipeline = Pipeline::from_provider(&config, &PipelineContext::new(app)).unwrap();
    pipeline.finished().await;

    let deltas = deltas(events).await;
    assert_eq!(deltas.len(), 2);
    assert!(deltas.iter().all(|(id, _)| id == "replay"));

    let (_, first) = &deltas[0];
    assert_eq!(first.updates[0].timestamp.as_deref(), Some("2023-11-14T22:13:20.000Z"));
    assert_eq!(first.updates[0].values[0].path, "navigation.speedOverGround");

    let (_, second) = &deltas[1];
    assert_eq!(second.updates[0].timestamp.as_deref(), Some("2023-11-14T22:13:21.000Z"));
    assert_eq!(second.updates[0].values[0].path, "navigation.headingTrue");
    let source = second.updates[0].source.as_ref().unwrap();
    assert_eq!(source.talker.as_deref(), Some("GP"));
}

#[tokio::test]
async fn test_live_mixed_lines_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.txt");
    let mut lines = Vec::new();
    for i in 0..100 {
        if i % 2 == 0 {
            lines.push(sentence(&format!("IIMTW,{}.0,C", i)));
        } else {
            lines.push(format!(
                r#"{{"updates":[{{"values":[{{"path":"environment.depth.belowKeel","value":{}}}]}}]}}"#,
                i
            ));
        }
    }
    std::fs::write(&path, lines.join("\r\n")).unwrap();

    let (app, events) = AppHandle::channel(256);
    let mut config = ProviderConfig::new(
        "mixed",
        "filestream",
        "Multiplexed",
        json!({"filename": path.to_str().unwrap()}),
    );
    config.no_throttle = true;
    let pipeline = Pipeline::from_provider(&config, &PipelineContext::new(app)).unwrap();
    pipeline.finished().await;

    let deltas = deltas(events).await;
    assert_eq!(deltas.len(), 100);
    for (i, (_, delta)) in deltas.iter().enumerate() {
        let value = &delta.updates[0].values[0];
        if i % 2 == 0 {
            assert_eq!(value.path, "environment.water.temperature");
        } else {
            assert_eq!(value.path, "environment.depth.belowKeel");
            assert_eq!(value.value, json!(i));
        }
    }
}

#[tokio::test]
async fn test_tcp_nmea0183() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (app, mut events) = AppHandle::channel(64);
    let config = ProviderConfig::new(
        "gps",
        "tcp",
        "NMEA0183",
        json!({"host": "127.0.0.1", "port": port}),
    );
    let mut pipeline = Pipeline::from_provider(&config, &PipelineContext::new(app)).unwrap();

    let (mut socket, _) = listener.accept().await.unwrap();
    let line = format!("{}\r\n", sentence("GPHDT,123.4,T"));
    // split mid-sentence to exercise the line splitter
    let (a, b) = line.split_at(7);
    socket.write_all(a.as_bytes()).await.unwrap();
    socket.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    socket.write_all(b.as_bytes()).await.unwrap();

    let delta = next_delta(&mut events).await;
    let value = &delta.updates[0].values[0];
    assert_eq!(value.path, "navigation.headingTrue");
    let radians = value.value.as_f64().unwrap();
    assert!((radians - 123.4_f64.to_radians()).abs() < 1e-9);

    pipeline.end();
    pipeline.finished().await;
}
