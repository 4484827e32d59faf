//! End-to-end subprocess runs against scripted stand-in workers.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use sign_agent::{
    CredentialRecord, DocumentSigning, ManagerConfig, ManagerError, SubprocessManager,
    UnsignedDocument,
};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn unsigned(id: i64) -> UnsignedDocument {
    UnsignedDocument {
        document_id: id,
        filename: format!("invoice_{id:03}.pdf"),
        remote_model: "account.move".into(),
        remote_record_id: 100 + id,
        pdf_bytes: format!("%PDF-1.4 doc {id}").into_bytes(),
    }
}

fn credentials() -> CredentialRecord {
    CredentialRecord {
        username: "user@example.com".into(),
        password: "pw".into(),
        certificate_password: "certpw".into(),
        certificate_path: Some("/certs/user.p12".into()),
        use_hardware_token: false,
    }
}

fn config(worker: PathBuf, work_root: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::new(worker);
    config.poll_interval = Duration::from_millis(20);
    config.timeout = Duration::from_secs(5);
    config.exit_grace = Duration::from_secs(2);
    config.work_root = Some(work_root.to_path_buf());
    config
}

fn remaining_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

const SUCCESS_WORKER: &str = r#"#!/bin/sh
dir="$1"
cp "$dir/unsigned_1.pdf" "$dir/signed_1.pdf"
printf 'SIGNED' >> "$dir/signed_1.pdf"
cat > "$dir/output.json" <<'EOF'
{"results":[{"document_id":1,"remote_model":"account.move","remote_record_id":101,"signed_filename":"signed_1.pdf","original_filename":"invoice_001.pdf","success":true}]}
EOF
printf '%s' '{"phase":"success","progress":1,"total":1,"message":"signed 1 of 1"}' > "$dir/status.json"
"#;

const FAILING_WORKER: &str = r#"#!/bin/sh
dir="$1"
printf '%s' '{"phase":"error","progress":0,"total":1,"message":"certificate rejected"}' > "$dir/status.json"
exit 1
"#;

const HUNG_WORKER: &str = r#"#!/bin/sh
dir="$1"
printf '%s' '{"phase":"working","progress":0,"total":1,"message":"signing"}' > "$dir/status.json"
sleep 60
"#;

#[tokio::test]
async fn successful_run_returns_signed_documents_and_cleans_up() {
    let scripts = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let worker = write_script(scripts.path(), "fake-worker", SUCCESS_WORKER);

    let manager = SubprocessManager::new(config(worker, work_root.path()));
    let signed = manager
        .sign_documents(&[unsigned(1)], &credentials(), None)
        .await
        .unwrap();

    assert_eq!(signed.len(), 1);
    assert_eq!(signed[0].document_id, 1);
    assert_eq!(signed[0].signed_filename, "invoice_001_signed.pdf");
    assert!(signed[0].signed_pdf_bytes.ends_with(b"SIGNED"));
    assert_eq!(remaining_entries(work_root.path()), 0);
}

#[tokio::test]
async fn worker_error_surfaces_its_message() {
    let scripts = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let worker = write_script(scripts.path(), "fake-worker", FAILING_WORKER);

    let manager = SubprocessManager::new(config(worker, work_root.path()));
    let err = manager
        .sign_documents(&[unsigned(1)], &credentials(), None)
        .await
        .unwrap_err();

    match err {
        ManagerError::WorkerFailed(message) => {
            assert_eq!(message, "certificate rejected");
        }
        other => panic!("expected WorkerFailed, got {other:?}"),
    }
    assert_eq!(remaining_entries(work_root.path()), 0);
}

#[tokio::test]
async fn hung_worker_is_terminated_after_the_timeout() {
    let scripts = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let worker = write_script(scripts.path(), "fake-worker", HUNG_WORKER);

    let mut config = config(worker, work_root.path());
    config.timeout = Duration::from_millis(200);

    let manager = SubprocessManager::new(config);
    let err = manager
        .sign_documents(&[unsigned(1)], &credentials(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Timeout(_)));
    assert_eq!(remaining_entries(work_root.path()), 0);
}

#[tokio::test]
async fn missing_worker_binary_fails_spawn_and_cleans_up() {
    let work_root = tempfile::tempdir().unwrap();

    let manager = SubprocessManager::new(config(
        PathBuf::from("/nonexistent/sign-worker"),
        work_root.path(),
    ));
    let err = manager
        .sign_documents(&[unsigned(1)], &credentials(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Spawn(_)));
    assert_eq!(remaining_entries(work_root.path()), 0);
}

#[tokio::test]
async fn keep_work_dir_retains_the_run_directory() {
    let scripts = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let worker = write_script(scripts.path(), "fake-worker", SUCCESS_WORKER);

    let mut config = config(worker, work_root.path());
    config.keep_work_dir = true;

    let manager = SubprocessManager::new(config);
    manager
        .sign_documents(&[unsigned(1)], &credentials(), None)
        .await
        .unwrap();

    assert_eq!(remaining_entries(work_root.path()), 1);
}

#[tokio::test]
async fn progress_callbacks_fire_for_status_changes() {
    use std::sync::{Arc, Mutex};

    let scripts = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let worker = write_script(scripts.path(), "fake-worker", SUCCESS_WORKER);

    let manager = SubprocessManager::new(config(worker, work_root.path()));
    let seen: Arc<Mutex<Vec<(u32, u32, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    manager
        .sign_documents(
            &[unsigned(1)],
            &credentials(),
            Some(Arc::new(move |progress, total, message| {
                sink.lock().unwrap().push((progress, total, message.to_string()));
            })),
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert_eq!(*seen.last().unwrap(), (1, 1, "signed 1 of 1".to_string()));
}
