//! Shared fixtures: a fake remote-control daemon served over HTTP and an
//! in-memory mount table wired to it.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use csi_rclone::config::DaemonConfig;
use csi_rclone::daemon::RcClient;
use csi_rclone::error::Result;
use csi_rclone::mount::MountTable;

type Reply = (u16, Value);

/// State behind the fake daemon
#[derive(Default)]
pub struct FakeRc {
    requests: Mutex<Vec<(String, Value)>>,
    scripted: Mutex<HashMap<String, VecDeque<Reply>>>,
    configs: Mutex<HashMap<String, Value>>,
    mounted: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FakeRc {
    /// Queue a reply for the next call to `endpoint`
    pub fn script(&self, endpoint: &str, status: u16, body: Value) {
        self.scripted
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back((status, body));
    }

    /// Bodies of every request made to `endpoint`
    pub fn requests(&self, endpoint: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.configs.lock().contains_key(name)
    }

    pub fn mount_table(&self) -> SharedMountTable {
        SharedMountTable {
            mounted: self.mounted.clone(),
        }
    }

    fn reply(&self, endpoint: &str, body: Value) -> Reply {
        self.requests.lock().push((endpoint.to_string(), body.clone()));

        let scripted = self
            .scripted
            .lock()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        if let Some(reply) = scripted {
            return reply;
        }

        let str_field = |name: &str| body.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        match endpoint {
            "config/create" => {
                self.configs.lock().insert(str_field("name"), body.clone());
                (200, json!({}))
            }
            "config/delete" => {
                self.configs.lock().remove(&str_field("name"));
                (200, json!({}))
            }
            "mount/mount" => {
                self.mounted.lock().insert(PathBuf::from(str_field("mountPoint")));
                (200, json!({}))
            }
            "mount/unmount" => {
                if self.mounted.lock().remove(Path::new(&str_field("mountPoint"))) {
                    (200, json!({}))
                } else {
                    (500, json!({ "error": "mount not found", "status": 500 }))
                }
            }
            "core/stats" => (200, json!({ "bytes": 0, "transfers": 0 })),
            "vfs/stats" => (
                200,
                json!({ "diskCache": { "uploadsQueued": 0, "uploadsInProgress": 0 } }),
            ),
            _ => (200, json!({})),
        }
    }
}

async fn handle(
    State(rc): State<Arc<FakeRc>>,
    UrlPath(endpoint): UrlPath<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let (status, reply) = rc.reply(&endpoint, body);
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(reply),
    )
}

/// Serve a fake daemon on an ephemeral loopback port
pub async fn spawn_fake_rc() -> (Arc<FakeRc>, DaemonConfig) {
    let rc = Arc::new(FakeRc::default());
    let app = Router::new()
        .route("/{*endpoint}", post(handle))
        .with_state(rc.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = DaemonConfig {
        address,
        ..Default::default()
    };
    (rc, config)
}

pub fn client(config: &DaemonConfig) -> RcClient {
    RcClient::new(config).unwrap()
}

/// Mount table that sees mounts made through a [`FakeRc`]
#[derive(Clone)]
pub struct SharedMountTable {
    mounted: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MountTable for SharedMountTable {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().contains(path))
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        self.mounted.lock().remove(path);
        Ok(())
    }
}
