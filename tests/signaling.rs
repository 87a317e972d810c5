use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use serde_json::json;

use liveframe::orchestrator::Orchestrator;
use liveframe::signaling::AnswerResponse;
use liveframe::telemetry::Telemetry;

mod common;

use common::{FakeFactory, CANDIDATE, OFFER};

async fn serve(dir: &std::path::Path) -> (Orchestrator, Arc<FakeFactory>, SocketAddr) {
    let orchestrator = Orchestrator::new(common::config_in(dir), Telemetry::disabled());
    let factory = Arc::new(FakeFactory::default());
    orchestrator.start_signaling(factory.clone()).await.unwrap();
    let addr = orchestrator.signaling_addr().unwrap();
    (orchestrator, factory, addr)
}

#[tokio::test]
async fn offer_candidates_and_hangup() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, factory, addr) = serve(dir.path()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("http://{addr}/offer"))
        .json(&json!({ "type": "offer", "sdp": OFFER }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let answer: AnswerResponse = res.json().await.unwrap();
    assert_eq!(answer.kind, "answer");
    assert!(answer.sdp.starts_with("v=0"));

    let res = client
        .post(format!("http://{addr}/offer"))
        .json(&json!({ "sdp": OFFER }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = client
        .post(format!("http://{addr}/candidate"))
        .json(&json!({ "candidate": CANDIDATE }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let frag = format!(
        "a=ice-ufrag:abcd\r\na=ice-pwd:0123456789abcdef0123\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\na={}\r\n",
        CANDIDATE.replace("50000", "50002")
    );
    let res = client
        .patch(format!("http://{addr}/session"))
        .header("Content-Type", "application/trickle-ice-sdpfrag")
        .body(frag)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    {
        let session = factory.last();
        let candidates = session.candidates.lock().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidates[0].sdp_mline_index, Some(0));
        assert_eq!(candidates[1].username_fragment.as_deref(), Some("abcd"));
    }

    let res = client
        .delete(format!("http://{addr}/session"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .post(format!("http://{addr}/offer"))
        .json(&json!({ "sdp": OFFER }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(factory.sessions.lock().unwrap().len(), 2);

    orchestrator.stop().await;
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, factory, addr) = serve(dir.path()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("http://{addr}/offer"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("http://{addr}/offer"))
        .json(&json!({ "sdp": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(factory.sessions.lock().unwrap().is_empty());

    let res = client
        .post(format!("http://{addr}/candidate"))
        .json(&json!({ "candidate": CANDIDATE }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = client
        .patch(format!("http://{addr}/session"))
        .header("Content-Type", "text/plain")
        .body("a=candidate:1 1 udp 1 1.2.3.4 5 typ host")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    orchestrator.stop().await;
}

#[tokio::test]
async fn stop_shuts_the_server_down() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _factory, addr) = serve(dir.path()).await;
    orchestrator.stop().await;
    assert!(reqwest::Client::new()
        .post(format!("http://{addr}/offer"))
        .json(&json!({ "sdp": OFFER }))
        .send()
        .await
        .is_err());
}
