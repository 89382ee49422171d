use std::sync::Arc;

use serde_json::{json, Value};
use ws_seq::core::{MemoryUserDirectory, StaticIdentity, User, UserId, WorkspaceId};
use ws_seq::index::WorkspaceRegistry;
use ws_seq::query::{QueryServer, WorkspaceView, USER_HEADER};

async fn spawn_server() -> String {
    let users = Arc::new(MemoryUserDirectory::from_users([
        User::new(UserId(1), "admin"),
        User::new(UserId(7), "editor"),
    ]));
    let registry = Arc::new(
        WorkspaceRegistry::new(WorkspaceId(1))
            .unwrap()
            .with_users(users.clone()),
    );
    registry
        .ensure_default_workspace(&StaticIdentity(UserId(1)))
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = QueryServer::new(registry, users, UserId::ANONYMOUS);
    tokio::spawn(server.serve(listener));
    format!("http://{}", addr)
}

fn change(entity_id: u64) -> Value {
    json!({
        "entity_type_id": "node",
        "entity_id": entity_id,
        "entity_uuid": "4f1c7a3e-8a5b-4c7e-9d6a-2b1e0f3c5d7a",
        "revision_id": 1,
        "rev": "1-abc",
    })
}

#[tokio::test]
async fn create_defaults_owner_from_header() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/workspaces"))
        .header(USER_HEADER, "7")
        .json(&json!({ "label": "Stage", "machine_name": "stage" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let ws: WorkspaceView = resp.json().await.unwrap();
    assert_eq!(ws.id, Some(2));
    assert_eq!(ws.owner_id, Some(UserId(7)));
    assert_eq!(ws.owner.map(|u| u.name), Some("editor".to_string()));
    assert!(ws.published);
    assert!(!ws.is_default);

    // 无请求头：匿名用户
    let ws: WorkspaceView = client
        .post(format!("{base}/workspaces"))
        .json(&json!({ "label": "Dev", "machine_name": "dev" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ws.owner_id, Some(UserId::ANONYMOUS));
    assert!(ws.owner.is_none());
}

#[tokio::test]
async fn invalid_machine_name_is_422() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/workspaces"))
        .json(&json!({ "label": "Bad", "machine_name": "Bad Name" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["violations"][0]["field"], "machine_name");
}

#[tokio::test]
async fn default_workspace_cannot_be_unpublished() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .patch(format!("{base}/workspaces/1"))
        .json(&json!({ "published": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    let live: WorkspaceView = client
        .get(format!("{base}/workspaces/1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(live.published);
    assert!(live.is_default);
    assert_eq!(live.machine_name, "live");
}

#[tokio::test]
async fn changes_advance_update_seq() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    for i in 1..=3 {
        let resp = client
            .post(format!("{base}/workspaces/1/changes"))
            .json(&change(i))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }

    let seq: Value = client
        .get(format!("{base}/workspaces/1/update_seq"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(seq["update_seq"], 3);

    let feed: Vec<Value> = client
        .get(format!("{base}/workspaces/1/changes?since=1&limit=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0]["seq"], 2);

    let resp = client
        .get(format!("{base}/workspaces/99/update_seq"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn patch_creates_revisions_and_list_filters() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    for name in ["stage", "stage_eu"] {
        client
            .post(format!("{base}/workspaces"))
            .json(&json!({ "label": name, "machine_name": name }))
            .send()
            .await
            .unwrap();
    }

    let resp = client
        .patch(format!("{base}/workspaces/2"))
        .json(&json!({ "label": "Staging" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let revs: Vec<Value> = client
        .get(format!("{base}/workspaces/2/revisions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(revs.len(), 2);
    assert_eq!(revs[1]["label"], "Staging");

    let listed: Vec<WorkspaceView> = client
        .get(format!("{base}/workspaces?machine_name=stage*"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);

    let status: Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["workspace_count"], 3);
    assert_eq!(status["revision_count"], 4);
}

#[tokio::test]
async fn unknown_owner_is_422() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/workspaces"))
        .header(USER_HEADER, "424242")
        .json(&json!({ "label": "Stage", "machine_name": "stage" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["violations"][0]["field"], "uid");
}

#[tokio::test]
async fn schema_lists_field_definitions() {
    let base = spawn_server().await;
    let fields: Vec<Value> = reqwest::get(format!("{base}/schema"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let machine_name = fields
        .iter()
        .find(|f| f["name"] == "machine_name")
        .unwrap();
    assert_eq!(machine_name["description"], "The workspace machine name.");
    assert_eq!(machine_name["kind"], "string");
    assert_eq!(machine_name["max_length"], 128);
    let uid = fields.iter().find(|f| f["name"] == "uid").unwrap();
    assert_eq!(uid["kind"]["entity_reference"]["target_type"], "user");
}
