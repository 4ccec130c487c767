use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use color_eyre::Result;
use kagami::config::Config;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// An in-process upstream archive serving a fixed set of files and
/// recording every requested path.
#[allow(dead_code)]
pub struct Upstream {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
struct ServerState {
    files: Arc<HashMap<String, Vec<u8>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

async fn serve_file(State(state): State<ServerState>, uri: Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/').to_string();
    state.requests.lock().unwrap().push(path.clone());

    match state.files.get(&path) {
        Some(data) => data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[allow(dead_code)]
impl Upstream {
    pub async fn serve(files: HashMap<String, Vec<u8>>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = ServerState {
            files: Arc::new(files),
            requests: requests.clone(),
        };
        let app = Router::new().fallback(serve_file).with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            requests,
        })
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[allow(dead_code)]
pub fn digests(data: &[u8]) -> (String, String, String) {
    (
        hex::encode(Md5::digest(data)),
        hex::encode(Sha1::digest(data)),
        hex::encode(Sha256::digest(data)),
    )
}

/// Renders a Packages index for `(filename, content)` items.
#[allow(dead_code)]
pub fn packages_index(items: &[(&str, &[u8])]) -> String {
    let mut out = String::new();
    for (filename, data) in items {
        let name = filename
            .rsplit('/')
            .next()
            .unwrap()
            .split('_')
            .next()
            .unwrap();
        let (md5, sha1, sha256) = digests(data);
        out.push_str(&format!(
            "Package: {name}\n\
             Version: 1.0\n\
             Architecture: amd64\n\
             Filename: {filename}\n\
             Size: {}\n\
             MD5sum: {md5}\n\
             SHA1: {sha1}\n\
             SHA256: {sha256}\n\n",
            data.len()
        ));
    }
    out
}

/// Renders a Release file for `(path-below-dists/<suite>, content)`
/// index entries.
#[allow(dead_code)]
pub fn release_index(by_hash: bool, entries: &[(&str, &[u8])]) -> String {
    let mut out = String::from("Origin: Test\nLabel: Test\nSuite: noble\n");
    if by_hash {
        out.push_str("Acquire-By-Hash: yes\n");
    }

    for (field, pick) in [
        ("MD5Sum", 0usize),
        ("SHA1", 1),
        ("SHA256", 2),
    ] {
        out.push_str(field);
        out.push_str(":\n");
        for (path, data) in entries {
            let all = digests(data);
            let digest = [&all.0, &all.1, &all.2][pick];
            out.push_str(&format!(" {digest} {} {path}\n", data.len()));
        }
    }
    out
}

#[allow(dead_code)]
pub fn test_config(dir: &Path, base_url: &str) -> Result<Config> {
    let yaml = format!(
        "
dir: {}
max_conns: 4
mirrors:
  test:
    url: {base_url}
    suites:
      - noble
    sections:
      - main
    architectures:
      - amd64
",
        dir.display()
    );
    Ok(yaml.parse()?)
}
