//! A real server on a loopback port, driven by the real client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gated_file_transfer::audit::{AuditKind, MemoryAuditSink, Outcome};
use gated_file_transfer::cipher::{transform, CipherContext};
use gated_file_transfer::client::{spawn_transfer, Client, ClientConfig, JobOutcome, TransferJob};
use gated_file_transfer::config::{Account, Accounts};
use gated_file_transfer::gate::{Gate, DOWNLOAD_DENIED};
use gated_file_transfer::policy::{AccessPolicy, AddressList, Permissions};
use gated_file_transfer::progress::NoProgress;
use gated_file_transfer::remote::{RemoteError, RemoteFs};
use gated_file_transfer::server::Server;
use gated_file_transfer::tls::{
    generate_self_signed_cert, ClientTlsConfig, ClientTransport, ServerTlsConfig, ServerTransport,
};
use gated_file_transfer::transfer::{download_file, upload_directory, upload_file, TransferError};
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct Fixture {
    dir: TempDir,
    root: PathBuf,
    outside: PathBuf,
    addr: SocketAddr,
    audit: Arc<MemoryAuditSink>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl Fixture {
    async fn start(whitelist: &[&str], blacklist: &[&str], per_ip: usize) -> Self {
        Self::start_with(whitelist, blacklist, per_ip, ServerTransport::plain()).await
    }

    async fn start_with(
        whitelist: &[&str],
        blacklist: &[&str],
        per_ip: usize,
        transport: ServerTransport,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();

        let policy = AccessPolicy::new(
            &root,
            AddressList::parse(whitelist).unwrap(),
            AddressList::parse(blacklist).unwrap(),
        )
        .unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = Gate::new(Arc::new(policy), audit.clone());
        let accounts = Accounts::new([
            Account::new("alice", "pw", Permissions::parse("elradfmw").unwrap(), &root),
            Account::new("stray", "pw", Permissions::all(), &outside),
        ]);

        let bound = Server::new(gate, accounts)
            .with_limits(32, per_ip)
            .with_transport(transport)
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = bound.local_addr().unwrap();
        let server = tokio::spawn(bound.run());

        Self {
            dir,
            root,
            outside,
            addr,
            audit,
            server,
        }
    }

    async fn open() -> Self {
        Self::start(&["127.0.0.0/8"], &[], 8).await
    }

    fn client(&self, user: &str, password: &str) -> Client {
        self.client_over(ClientTransport::plain(), user, password)
    }

    fn client_over(&self, transport: ClientTransport, user: &str, password: &str) -> Client {
        Client::new(ClientConfig {
            server_addr: self.addr.to_string(),
            transport,
            username: user.to_string(),
            password: password.to_string(),
        })
    }

    fn local(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }
}

fn plain() -> CipherContext {
    CipherContext::disabled()
}

#[tokio::test]
async fn upload_then_list_and_size() {
    let fx = Fixture::open().await;
    let src = fx.local("hello.txt", b"hello over the wire");

    let mut session = fx.client("alice", "pw").connect().await.unwrap();
    let report = upload_file(&mut session, &src, "/hello.txt", &plain(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.bytes, 19);

    let listing = session.list("/").await.unwrap();
    assert!(listing.iter().any(|f| f.name == "hello.txt" && f.size == 19));
    assert_eq!(session.size("/hello.txt").await.unwrap(), 19);
    session.quit().await.unwrap();

    assert_eq!(
        std::fs::read(fx.root.join("hello.txt")).unwrap(),
        b"hello over the wire"
    );
    assert!(fx
        .audit
        .events()
        .iter()
        .any(|e| e.kind == AuditKind::FileReceived && e.identity.as_deref() == Some("alice")));
}

#[tokio::test]
async fn encrypted_upload_stores_ciphertext() {
    let fx = Fixture::open().await;
    let plaintext = b"attack at dawn, bring snacks".to_vec();
    let src = fx.local("plan.txt", &plaintext);

    let mut session = fx.client("alice", "pw").connect().await.unwrap();
    upload_file(
        &mut session,
        &src,
        "/plan.txt",
        &CipherContext::new("k3y"),
        &NoProgress,
    )
    .await
    .unwrap();
    session.quit().await.unwrap();

    let stored = std::fs::read(fx.root.join("plan.txt")).unwrap();
    assert_ne!(stored, plaintext);
    assert_eq!(stored, transform(&plaintext, b"k3y"));
    assert_eq!(transform(&stored, b"k3y"), plaintext);
}

#[tokio::test]
async fn retrieve_is_always_denied() {
    let fx = Fixture::open().await;
    std::fs::write(fx.root.join("report.pdf"), b"%PDF").unwrap();
    let out = fx.dir.path().join("downloads");
    std::fs::create_dir_all(&out).unwrap();

    let mut session = fx.client("alice", "pw").connect().await.unwrap();
    let err = download_file(&mut session, "/report.pdf", &out, &plain(), &NoProgress)
        .await
        .unwrap_err();

    match err {
        TransferError::Rejected { reply, .. } => {
            assert_eq!(reply.code, 553);
            assert_eq!(reply.message, DOWNLOAD_DENIED);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!out.join("report.pdf").exists());

    // The session survives the denial
    assert_eq!(session.current_directory().await.unwrap(), "/");
    session.quit().await.unwrap();
}

#[tokio::test]
async fn store_outside_root_is_denied_and_nothing_is_written() {
    let fx = Fixture::open().await;
    let src = fx.local("x.txt", b"x");

    let mut session = fx.client("stray", "pw").connect().await.unwrap();
    let err = upload_file(&mut session, &src, "/x.txt", &plain(), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Rejected { ref reply, .. } if reply.code == 553));
    session.quit().await.unwrap();

    assert!(!fx.outside.join("x.txt").exists());
    assert!(fx.audit.events().iter().any(|e| e.kind == AuditKind::Command
        && e.outcome == Outcome::Denied("Permission denied".into())));
}

#[tokio::test]
async fn address_outside_whitelist_cannot_write() {
    let fx = Fixture::start(&["10.9.8.7"], &[], 8).await;
    let mut session = fx.client("alice", "pw").connect().await.unwrap();

    match session.make_directory("/new").await {
        Err(RemoteError::Rejected(reply)) => {
            assert_eq!(reply.code, 553);
            assert_eq!(reply.message, "Permission denied: IP not in whitelist");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!fx.root.join("new").exists());

    // Read-only verbs are not gated
    assert!(session.list("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn blacklisted_address_is_refused_on_connect() {
    let fx = Fixture::start(&["127.0.0.1"], &["127.0.0.1"], 8).await;

    let err = fx.client("alice", "pw").connect().await.err().unwrap();
    assert!(format!("{:#}", err).contains("530"));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let fx = Fixture::open().await;

    let err = fx.client("alice", "nope").connect().await.err().unwrap();
    assert!(format!("{:#}", err).contains("530"));
    assert!(fx
        .audit
        .events()
        .iter()
        .any(|e| e.kind == AuditKind::LoginFailed));
}

#[tokio::test]
async fn directory_verbs() {
    let fx = Fixture::open().await;
    let src = fx.local("draft.txt", b"v1");

    let mut session = fx.client("alice", "pw").connect().await.unwrap();
    session.make_directory("/docs").await.unwrap();
    upload_file(&mut session, &src, "/docs/draft.txt", &plain(), &NoProgress)
        .await
        .unwrap();

    session.rename("/docs/draft.txt", "/docs/final.txt").await.unwrap();
    assert!(fx.root.join("docs/final.txt").exists());
    assert!(!fx.root.join("docs/draft.txt").exists());

    session.change_directory("/docs").await.unwrap();
    assert_eq!(session.current_directory().await.unwrap(), "/docs");

    session.delete("final.txt").await.unwrap();
    session.remove_directory("/docs").await.unwrap();
    assert!(!fx.root.join("docs").exists());
    session.quit().await.unwrap();
}

#[tokio::test]
async fn upload_directory_mirrors_tree() {
    let fx = Fixture::open().await;
    let tree = fx.dir.path().join("site");
    fx.local("site/index.html", b"<h1>hi</h1>");
    fx.local("site/css/main.css", b"body {}");
    fx.local("site/css/print/print.css", b"@media print {}");

    let mut session = fx.client("alice", "pw").connect().await.unwrap();
    let report = upload_directory(&mut session, &tree, "/www/site", &plain(), &NoProgress)
        .await
        .unwrap();
    session.quit().await.unwrap();

    assert_eq!(report.files, 3);
    assert_eq!(report.directories, 2);
    assert_eq!(
        std::fs::read(fx.root.join("www/site/css/print/print.css")).unwrap(),
        b"@media print {}"
    );
    assert_eq!(
        std::fs::read(fx.root.join("www/site/index.html")).unwrap(),
        b"<h1>hi</h1>"
    );
}

#[tokio::test]
async fn concurrent_jobs_use_separate_connections() {
    let fx = Fixture::open().await;
    let client = fx.client("alice", "pw");

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let local = fx.local(&format!("part{}.bin", i), &vec![i as u8; 10_000 + i]);
            let job = TransferJob::Upload {
                local,
                remote: format!("/part{}.bin", i),
            };
            spawn_transfer(client.clone(), job, plain(), Arc::new(NoProgress))
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await.unwrap().unwrap() {
            JobOutcome::File(report) => assert_eq!(report.bytes, (10_000 + i) as u64),
            other => panic!("unexpected {:?}", other),
        }
        let stored = std::fs::read(fx.root.join(format!("part{}.bin", i))).unwrap();
        assert_eq!(stored, vec![i as u8; 10_000 + i]);
    }
}

#[tokio::test]
async fn per_address_limit_refuses_extra_sessions() {
    let fx = Fixture::start(&["127.0.0.1"], &[], 1).await;
    let client = fx.client("alice", "pw");

    let first = client.connect().await.unwrap();
    let err = client.connect().await.err().unwrap();
    assert!(format!("{:#}", err).contains("421"));

    // Existing sessions are unaffected
    let mut first = first;
    assert_eq!(first.current_directory().await.unwrap(), "/");
    first.quit().await.unwrap();

    // The slot frees once the server side of the session ends
    let mut admitted = false;
    for _ in 0..50 {
        if let Ok(session) = client.connect().await {
            session.quit().await.unwrap();
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(admitted);
}

#[tokio::test]
async fn upload_over_tls() {
    let cert = generate_self_signed_cert("localhost", &["localhost"], &[]).unwrap();
    let server_tls = ServerTlsConfig::from_pem(&cert.cert_pem, &cert.key_pem).unwrap();
    let fx = Fixture::start_with(&["127.0.0.1"], &[], 8, ServerTransport::tls(server_tls)).await;

    let client_tls = ClientTlsConfig::from_ca_pem(&cert.cert_pem, "localhost").unwrap();
    let client = fx.client_over(ClientTransport::tls(client_tls), "alice", "pw");
    let src = fx.local("secret.txt", b"sealed in transit");

    let mut session = client.connect().await.unwrap();
    upload_file(&mut session, &src, "/secret.txt", &plain(), &NoProgress)
        .await
        .unwrap();
    session.quit().await.unwrap();

    assert_eq!(
        std::fs::read(fx.root.join("secret.txt")).unwrap(),
        b"sealed in transit"
    );
}
