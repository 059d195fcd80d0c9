//! Client side of the LFS batch API, used while importing a mirror to
//! pull large objects from the upstream store.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lfs::content::ContentStore;

const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

/// A pointer reference harvested from the repository: the object id and
/// its declared size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRef {
    pub oid: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct LsFilesOutput {
    files: Vec<PointerRef>,
}

/// List the LFS pointer objects reachable from any ref of the bare
/// repository at `repo`, via `git lfs ls-files --all --json`.
///
/// # Errors
/// Fails when the LFS tool is missing or its output cannot be decoded;
/// callers treat this phase as best-effort.
pub fn pointer_refs(repo: &Path) -> Result<Vec<PointerRef>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["lfs", "ls-files", "--all", "--json"])
        .output()?;
    if !output.status.success() {
        return Err(Error::git_msg(format!(
            "git lfs ls-files failed: {}",
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }

    let parsed: LsFilesOutput = serde_json::from_slice(&output.stdout)?;

    // The same object may back several paths or refs.
    let mut seen = std::collections::HashSet::new();
    let mut refs = Vec::new();
    for p in parsed.files {
        if seen.insert(p.oid.clone()) {
            refs.push(p);
        }
    }
    Ok(refs)
}

// ---------------------------------------------------------------------------
// Batch API
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operation: &'a str,
    transfers: &'a [&'a str],
    objects: &'a [PointerRef],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    objects: Vec<BatchObject>,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    oid: String,
    size: u64,
    #[serde(default)]
    actions: Option<HashMap<String, BatchAction>>,
    #[serde(default)]
    error: Option<BatchObjectError>,
}

#[derive(Debug, Deserialize)]
struct BatchAction {
    href: String,
    #[serde(default)]
    header: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct BatchObjectError {
    code: i64,
    message: String,
}

/// Client for one upstream LFS endpoint (`<source>/info/lfs`).
pub struct BatchClient {
    endpoint: String,
    http: reqwest::blocking::Client,
}

impl BatchClient {
    pub fn new(source_url: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(BatchClient {
            endpoint: format!("{}/info/lfs", source_url.trim_end_matches('/')),
            http,
        })
    }

    /// Ask the upstream for download actions covering `objects`.
    fn batch_download(&self, objects: &[PointerRef]) -> Result<Vec<BatchObject>> {
        let request = BatchRequest {
            operation: "download",
            transfers: &["basic"],
            objects,
        };
        let response = self
            .http
            .post(format!("{}/objects/batch", self.endpoint))
            .header(reqwest::header::ACCEPT, LFS_MEDIA_TYPE)
            .header(reqwest::header::CONTENT_TYPE, LFS_MEDIA_TYPE)
            .json(&request)
            .send()?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "lfs batch returned {}",
                response.status(),
            )));
        }
        Ok(response.json::<BatchResponse>()?.objects)
    }

    /// Stream one object into `store`, verifying size and digest.
    fn fetch_object(&self, object: &BatchObject, store: &ContentStore) -> Result<()> {
        let action = object
            .actions
            .as_ref()
            .and_then(|a| a.get("download"))
            .ok_or_else(|| {
                let detail = object
                    .error
                    .as_ref()
                    .map(|e| format!("{} {}", e.code, e.message))
                    .unwrap_or_else(|| "no download action".to_string());
                Error::upstream(format!("object {}: {}", object.oid, detail))
            })?;

        let mut request = self.http.get(&action.href);
        if let Some(headers) = &action.header {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        let mut response = request.send()?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "object {} download returned {}",
                object.oid,
                response.status(),
            )));
        }

        store.put(&object.oid, &mut response, object.size)
    }
}

/// Pull every LFS object referenced by the repository at `repo` that is
/// not yet in `store`, from the upstream at `source_url`.
///
/// Returns the number of objects fetched. Individual object failures are
/// logged and counted but do not abort the remaining transfers.
pub fn import_objects(repo: &Path, source_url: &str, store: &ContentStore) -> Result<usize> {
    let refs = pointer_refs(repo)?;
    let missing: Vec<PointerRef> = refs
        .into_iter()
        .filter(|p| !store.exists(&p.oid))
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let client = BatchClient::new(source_url)?;
    let objects = client.batch_download(&missing)?;

    let mut fetched = 0;
    let mut failed = 0;
    for object in &objects {
        match client.fetch_object(object, store) {
            Ok(()) => {
                debug!(oid = %object.oid, size = object.size, "fetched lfs object");
                fetched += 1;
            }
            Err(e) => {
                warn!(oid = %object.oid, error = %e, "lfs object fetch failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(Error::upstream(format!(
            "{} of {} lfs objects failed to transfer",
            failed,
            objects.len(),
        )));
    }
    Ok(fetched)
}
