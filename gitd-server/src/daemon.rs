//! Native git daemon protocol (git:// on TCP 9418).
//!
//! Each connection opens with one packet-line request such as
//! `git-upload-pack /demo.git\0host=example.com\0`; the stream is then
//! bridged to the same subprocess backend the HTTP side uses.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tracing::{debug, info, warn};

use gitd::{paths, pkt, RepoStore, Service};

/// Marker file required in a repository before the daemon will export
/// it, unless `--export-all` is set.
const EXPORT_OK: &str = "git-daemon-export-ok";

pub struct Daemon {
    roots: Vec<RepoStore>,
    export_all: bool,
    enable_receive: bool,
}

impl Daemon {
    pub fn new(roots: Vec<RepoStore>, export_all: bool, enable_receive: bool) -> Self {
        Daemon {
            roots,
            export_all,
            enable_receive,
        }
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "git daemon listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = daemon.handle(socket).await {
                    debug!(%peer, error = %e, "daemon connection closed");
                }
            });
        }
    }

    async fn handle(&self, mut socket: TcpStream) -> std::io::Result<()> {
        let request = match read_pkt_line(&mut socket).await? {
            Some(request) => request,
            None => return Ok(()),
        };

        let (service, repo_path) = match self.route(&request) {
            Ok(target) => target,
            Err(msg) => {
                send_err(&mut socket, &msg).await?;
                return Ok(());
            }
        };

        debug!(service = %service, repo = %repo_path.display(), "daemon request");

        let mut child = Command::new("git")
            .arg(service.command())
            .arg(&repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take())
        else {
            send_err(&mut socket, "service unavailable").await?;
            return Ok(());
        };

        let (mut read_half, mut write_half) = socket.into_split();
        let pump = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut read_half, &mut stdin).await;
        });

        let result = tokio::io::copy(&mut stdout, &mut write_half).await;
        pump.abort();
        let _ = write_half.shutdown().await;
        let _ = child.wait().await;
        result.map(|_| ())
    }

    /// Parse the handshake and resolve it to a service and an exported
    /// repository, or the `ERR` message to send back.
    fn route(&self, request: &[u8]) -> Result<(Service, PathBuf), String> {
        let request = String::from_utf8_lossy(request);
        // "<service> <path>\0host=<h>\0[extras]": everything after the
        // first NUL is host/extra parameters we do not need.
        let head = request.split('\0').next().unwrap_or("");
        let (service_name, url_path) = head
            .split_once(' ')
            .ok_or_else(|| "invalid request".to_string())?;

        let service = Service::from_wire(service_name)
            .ok_or_else(|| format!("service {} not enabled", service_name))?;
        if service == Service::ReceivePack && !self.enable_receive {
            return Err("service git-receive-pack not enabled".to_string());
        }

        let (store, repo_path) = self
            .roots
            .iter()
            .find_map(|store| {
                let path = store.resolve(url_path).ok()?;
                paths::is_repository(&path).then_some((store, path))
            })
            .ok_or_else(|| "repository not found".to_string())?;

        if !self.export_all && !repo_path.join(EXPORT_OK).exists() {
            return Err("repository not found".to_string());
        }

        if service == Service::ReceivePack {
            match store.mirror_config(&repo_path) {
                Ok((true, _)) => {
                    return Err("repository is a read-only mirror".to_string());
                }
                Ok((false, _)) => {}
                Err(e) => {
                    warn!(repo = %repo_path.display(), error = %e, "mirror config read failed");
                    return Err("repository unavailable".to_string());
                }
            }
        }

        Ok((service, repo_path))
    }
}

async fn read_pkt_line(socket: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;

    let len = std::str::from_utf8(&len_buf)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| std::io::Error::other("bad packet length"))?;

    if len == 0 {
        return Ok(None);
    }
    if !(4..=65520).contains(&len) {
        return Err(std::io::Error::other("bad packet length"));
    }

    let mut payload = vec![0u8; len - 4];
    socket.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn send_err(socket: &mut TcpStream, msg: &str) -> std::io::Result<()> {
    let line = pkt::pkt_line_str(&format!("ERR {}", msg));
    socket.write_all(&line).await?;
    socket.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon(dir: &std::path::Path, export_all: bool, enable_receive: bool) -> Daemon {
        let store = RepoStore::new(dir.join("root")).unwrap();
        store.create("demo", "main").unwrap();
        Daemon::new(vec![store], export_all, enable_receive)
    }

    fn request(service: &str, path: &str) -> Vec<u8> {
        format!("{} {}\0host=localhost\0", service, path).into_bytes()
    }

    #[test]
    fn route_rejects_unknown_service_and_repo() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(dir.path(), true, false);

        let err = daemon
            .route(&request("git-upload-archive", "/demo.git"))
            .unwrap_err();
        assert!(err.contains("not enabled"));

        let err = daemon
            .route(&request("git-upload-pack", "/ghost.git"))
            .unwrap_err();
        assert_eq!(err, "repository not found");

        assert!(daemon.route(b"garbage-without-space").is_err());
    }

    #[test]
    fn route_requires_export_marker_unless_export_all() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(dir.path(), false, false);

        let err = daemon
            .route(&request("git-upload-pack", "/demo.git"))
            .unwrap_err();
        assert_eq!(err, "repository not found");

        let repo = dir.path().join("root/demo.git");
        std::fs::write(repo.join(EXPORT_OK), b"").unwrap();
        let (service, path) = daemon
            .route(&request("git-upload-pack", "/demo.git"))
            .unwrap();
        assert_eq!(service, Service::UploadPack);
        assert!(path.ends_with("demo.git"));
    }

    #[test]
    fn route_gates_receive_pack() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(dir.path(), true, false);

        let err = daemon
            .route(&request("git-receive-pack", "/demo.git"))
            .unwrap_err();
        assert!(err.contains("not enabled"));

        let daemon = {
            let store = RepoStore::new(dir.path().join("root")).unwrap();
            Daemon::new(vec![store], true, true)
        };
        assert!(daemon.route(&request("git-receive-pack", "/demo.git")).is_ok());

        // Mirrors stay read-only on the daemon too.
        let mut config = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("root/demo.git/config"))
            .unwrap();
        use std::io::Write;
        writeln!(config, "[remote \"origin\"]").unwrap();
        writeln!(config, "\turl = file:///nowhere/up.git").unwrap();
        writeln!(config, "\tmirror = true").unwrap();
        drop(config);

        let err = daemon
            .route(&request("git-receive-pack", "/demo.git"))
            .unwrap_err();
        assert!(err.contains("read-only"));
        // Reads still work.
        assert!(daemon.route(&request("git-upload-pack", "/demo.git")).is_ok());
    }

    #[tokio::test]
    async fn unknown_repo_gets_an_err_packet() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(daemon(dir.path(), true, false));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(daemon.serve(listener));

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(&pkt::pkt_line(&request("git-upload-pack", "/ghost.git")))
            .await
            .unwrap();

        let mut reply = Vec::new();
        socket.read_to_end(&mut reply).await.unwrap();
        let text = String::from_utf8_lossy(&reply);
        assert!(text[4..].starts_with("ERR repository not found"), "{}", text);
    }
}
