//! Integration tests for the HTTP remote against a mock server.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feed_sync::auth::{AuthContext, SharedAuth};
use feed_sync::config::RemoteConfig;
use feed_sync::entity::{AttachmentType, EntityKind, Event, Post};
use feed_sync::error::SyncError;
use feed_sync::mutation::PendingAttachment;
use feed_sync::remote::http::HttpRemote;
use feed_sync::remote::media::HttpMediaUploader;
use feed_sync::remote::{MediaUploader, RemoteApi};

fn config(server: &MockServer) -> RemoteConfig {
    RemoteConfig {
        base_url: server.uri(),
        request_timeout_secs: 5,
    }
}

fn anonymous() -> Arc<dyn AuthContext> {
    Arc::new(SharedAuth::anonymous())
}

fn post_json(id: i64, likers: &[i64]) -> serde_json::Value {
    json!({
        "id": id,
        "authorId": 1,
        "author": "alice",
        "content": format!("post {id}"),
        "published": 1_700_000_000 + id,
        "likeOwnerIds": likers,
    })
}

#[tokio::test]
async fn test_latest_page_is_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/posts/latest"))
        .and(query_param("count", "2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([post_json(9, &[]), post_json(8, &[4])])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let remote = HttpRemote::<Post>::new(&config(&server), anonymous()).unwrap();
    let page = remote.get_latest(2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, 9);
    assert_eq!(page[1].author, "alice");
    assert!(page[1].like_owner_ids.contains(&4));
}

#[tokio::test]
async fn test_before_and_newer_paths() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/30/before"))
        .and(query_param("count", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events/30/newer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let remote = HttpRemote::<Event>::new(&config(&server), anonymous()).unwrap();
    assert!(remote.get_before(30, 10).await.unwrap().is_empty());
    assert!(remote.get_newer(30).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_record_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/posts/77"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let remote = HttpRemote::<Post>::new(&config(&server), anonymous()).unwrap();
    let err = remote.get_by_id(77).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::NotFound {
            kind: EntityKind::Post,
            id: 77
        }
    );
}

#[tokio::test]
async fn test_server_error_is_rejected_and_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/posts/latest"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database down"))
        .mount(&server)
        .await;

    let remote = HttpRemote::<Post>::new(&config(&server), anonymous()).unwrap();
    match remote.get_latest(10).await.unwrap_err() {
        SyncError::RemoteRejected { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database down");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/posts/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;

    let remote = HttpRemote::<Post>::new(&config(&server), anonymous()).unwrap();
    let err = remote.get_latest(10).await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteRejected { status: 200, .. }));
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let server = MockServer::start().await;
    let config = config(&server);
    drop(server);

    let remote = HttpRemote::<Post>::new(&config, anonymous()).unwrap();
    let err = remote.get_latest(10).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

#[tokio::test]
async fn test_like_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/posts/5/likes"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(post_json(5, &[2])))
        .expect(1)
        .mount(&server)
        .await;

    let auth: Arc<dyn AuthContext> = Arc::new(SharedAuth::anonymous());
    let shared = Arc::new(SharedAuth::anonymous());
    shared.login(2, "s3cret");
    let remote = HttpRemote::<Post>::new(&config(&server), shared).unwrap();
    let liked = remote.like(5).await.unwrap();
    assert!(liked.like_owner_ids.contains(&2));

    // Anonymous requests carry no credentials and fall through to a 404.
    let anonymous_remote = HttpRemote::<Post>::new(&config(&server), auth).unwrap();
    assert!(matches!(
        anonymous_remote.like(5).await.unwrap_err(),
        SyncError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_save_posts_record_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/posts"))
        .and(body_partial_json(json!({"id": 0, "content": "hello"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 31,
            "authorId": 1,
            "content": "hello",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let remote = HttpRemote::<Post>::new(&config(&server), anonymous()).unwrap();
    let saved = remote.save(Post::draft(1, "hello")).await.unwrap();
    assert_eq!(saved.id, 31);
}

#[tokio::test]
async fn test_scoped_wall_feed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/7/wall/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([post_json(3, &[])])))
        .expect(1)
        .mount(&server)
        .await;

    let remote = HttpRemote::<Post>::new(&config(&server), anonymous())
        .unwrap()
        .scoped("7/wall");
    assert_eq!(remote.get_latest(5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_media_upload_returns_hosted_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/media"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"url": "https://cdn.test/a.jpg"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.jpg");
    std::fs::write(&file, b"\xff\xd8\xff").unwrap();

    let uploader = HttpMediaUploader::new(&config(&server), anonymous()).unwrap();
    let hosted = uploader
        .upload(&PendingAttachment {
            path: file,
            kind: AttachmentType::Image,
        })
        .await
        .unwrap();
    assert_eq!(hosted.url, "https://cdn.test/a.jpg");
    assert_eq!(hosted.kind, AttachmentType::Image);
}
