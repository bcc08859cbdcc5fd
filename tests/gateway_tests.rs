//! Gateway client tests against the in-process mock gateway.

mod support;

use exodus_rsync::args::Args;
use exodus_rsync::conf::{self, GlobalConfig};
use exodus_rsync::gw::{Client, GwError, ItemInput};
use exodus_rsync::walk::{ItemInfo, SyncItem};
use support::{spawn_gateway, write_config, MockGateway};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sha256_hex(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content))
}

/// Loads a config whose gateway URL points at the mock.
fn load_config(dir: &TempDir, gw: &MockGateway, global_extra: &str) -> GlobalConfig {
    let conf_path = write_config(dir.path(), &gw.url, global_extra, "");
    let args = Args {
        exodus_conf: Some(conf_path),
        ..Default::default()
    };
    conf::load(&args).expect("load config")
}

fn client_for(cfg: &GlobalConfig, dry_run: bool) -> Client {
    let env = cfg
        .environment_for_dest("exodus:/dest")
        .expect("environment matches");
    Client::new(&env, dry_run).expect("create client")
}

/// Writes a file and builds the sync item describing it.
fn item_for(dir: &TempDir, name: &str, content: &[u8]) -> SyncItem {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("write content file");
    SyncItem {
        src_path: path.display().to_string(),
        key: sha256_hex(content),
        link_to: String::new(),
        info: ItemInfo {
            size: content.len() as u64,
            ..Default::default()
        },
    }
}

fn link_item(name: &str, target: &str) -> SyncItem {
    SyncItem {
        src_path: name.to_string(),
        key: String::new(),
        link_to: target.to_string(),
        info: ItemInfo::default(),
    }
}

#[tokio::test]
async fn whoami_returns_identity() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    let token = CancellationToken::new();
    let identity = client.whoami(&token).await.expect("whoami");
    assert_eq!(identity["client"]["authenticated"], true);
}

#[tokio::test]
async fn ensure_uploaded_deduplicates_and_probes() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    let one = item_for(&dir, "one", b"shared content\n");
    let two = item_for(&dir, "two", b"shared content\n");
    let three = item_for(&dir, "three", b"already present\n");

    // Seed the third item's blob as already present.
    gw.state.lock().blobs.insert(three.key.clone());

    let (mut uploaded, mut present, mut duplicate) = (0, 0, 0);
    let token = CancellationToken::new();
    client
        .ensure_uploaded(
            &token,
            vec![one.clone(), two, three.clone()],
            |_| {
                uploaded += 1;
                Ok(())
            },
            |_| {
                present += 1;
                Ok(())
            },
            |_| {
                duplicate += 1;
                Ok(())
            },
        )
        .await
        .expect("ensure_uploaded");

    assert_eq!((uploaded, present, duplicate), (1, 1, 1));

    let inner = gw.state.lock();
    // Exactly one PUT per distinct missing key.
    assert_eq!(inner.uploads, vec![one.key.clone()]);
    // One probe per distinct key.
    assert_eq!(inner.head_probes.len(), 2);
    assert!(inner.head_probes.contains(&one.key));
    assert!(inner.head_probes.contains(&three.key));
}

#[tokio::test]
async fn ensure_uploaded_skips_link_items() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    let (mut uploaded, mut present, mut duplicate) = (0, 0, 0);
    let token = CancellationToken::new();
    client
        .ensure_uploaded(
            &token,
            vec![link_item("a-link", "target")],
            |_| {
                uploaded += 1;
                Ok(())
            },
            |_| {
                present += 1;
                Ok(())
            },
            |_| {
                duplicate += 1;
                Ok(())
            },
        )
        .await
        .expect("ensure_uploaded");

    assert_eq!((uploaded, present, duplicate), (0, 0, 0));
    assert!(gw.state.lock().head_probes.is_empty());
    assert!(gw.state.lock().uploads.is_empty());
}

#[tokio::test]
async fn ensure_uploaded_fails_on_upload_error() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "gwmaxattempts: 1\n");
    let client = client_for(&cfg, false);

    gw.state.lock().upload_status = 400;

    let item = item_for(&dir, "content", b"some content\n");
    let token = CancellationToken::new();
    let err = client
        .ensure_uploaded(&token, vec![item], |_| Ok(()), |_| Ok(()), |_| Ok(()))
        .await
        .expect_err("upload should fail");

    assert!(matches!(err, GwError::Upload { .. }), "got {err:?}");
    assert!(gw.state.lock().uploads.is_empty());
}

#[tokio::test]
async fn ensure_uploaded_fails_on_probe_error() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "gwmaxattempts: 1\n");
    let client = client_for(&cfg, false);

    gw.state.lock().absent_status = 500;

    let item = item_for(&dir, "content", b"some content\n");
    let token = CancellationToken::new();
    let err = client
        .ensure_uploaded(&token, vec![item], |_| Ok(()), |_| Ok(()), |_| Ok(()))
        .await
        .expect_err("probe should fail");

    assert!(matches!(err, GwError::Presence { .. }), "got {err:?}");
}

#[tokio::test]
async fn ensure_uploaded_propagates_callback_error() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    let item = item_for(&dir, "content", b"some content\n");
    let token = CancellationToken::new();
    let err = client
        .ensure_uploaded(
            &token,
            vec![item],
            |_| Err(GwError::Callback("simulated".to_string())),
            |_| Ok(()),
            |_| Ok(()),
        )
        .await
        .expect_err("callback error should propagate");

    assert!(matches!(err, GwError::Callback(msg) if msg == "simulated"));
}

#[tokio::test]
async fn publish_lifecycle_batches_and_commits() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "gwbatchsize: 2\n");
    let client = client_for(&cfg, false);

    gw.state.lock().polls_before_done = 3;

    let token = CancellationToken::new();
    let publish = client.new_publish(&token).await.expect("new publish");
    assert_eq!(publish.id(), "publish-1");

    let items: Vec<ItemInput> = (0..5)
        .map(|i| ItemInput {
            web_uri: format!("/dest/file-{i}"),
            object_key: format!("{i:064}"),
            ..Default::default()
        })
        .collect();

    publish.add_items(&token, &items).await.expect("add items");
    publish.commit(&token).await.expect("commit");

    let inner = gw.state.lock();
    assert_eq!(inner.created, vec!["publish-1"]);
    assert_eq!(inner.batches, vec![2, 2, 1]);
    assert_eq!(inner.items["publish-1"].len(), 5);
    assert_eq!(inner.commits.len(), 1);
    assert_eq!(inner.commits[0].0, "publish-1");
    // The poll counter is exhausted by the commit wait.
    assert_eq!(inner.polls_before_done, 0);
}

#[tokio::test]
async fn commit_forwards_commit_mode() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "gwcommit: xattrs\n");
    let client = client_for(&cfg, false);

    let token = CancellationToken::new();
    let publish = client.new_publish(&token).await.expect("new publish");
    publish.commit(&token).await.expect("commit");

    let inner = gw.state.lock();
    assert_eq!(inner.commits[0].1, "commit_mode=xattrs");
}

#[tokio::test]
async fn commit_fails_when_task_fails() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    gw.state.lock().final_task_state = "FAILED".to_string();

    let token = CancellationToken::new();
    let publish = client.new_publish(&token).await.expect("new publish");
    let err = publish.commit(&token).await.expect_err("commit should fail");

    assert!(matches!(err, GwError::TaskFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn joined_publish_updates_by_id() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    let token = CancellationToken::new();
    let publish = client.get_publish("abc123");
    assert_eq!(publish.id(), "abc123");

    let items = vec![ItemInput {
        web_uri: "/dest/file".to_string(),
        object_key: "0".repeat(64),
        ..Default::default()
    }];
    publish.add_items(&token, &items).await.expect("add items");

    let inner = gw.state.lock();
    // No publish was created server-side; items landed on the given id.
    assert!(inner.created.is_empty());
    assert_eq!(inner.items["abc123"].len(), 1);
}

#[tokio::test]
async fn add_items_surfaces_error_body() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    gw.state.lock().add_items_status = 400;

    let token = CancellationToken::new();
    let publish = client.new_publish(&token).await.expect("new publish");
    let err = publish
        .add_items(
            &token,
            &[ItemInput {
                web_uri: "/dest/file".to_string(),
                object_key: "0".repeat(64),
                ..Default::default()
            }],
        )
        .await
        .expect_err("add items should fail");

    match err {
        GwError::Status { status, .. } => assert_eq!(status.as_u16(), 400),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn dry_run_probes_but_never_writes() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, true);

    let item = item_for(&dir, "content", b"some content\n");
    let key = item.key.clone();

    let (mut uploaded, mut present) = (0, 0);
    let token = CancellationToken::new();
    client
        .ensure_uploaded(
            &token,
            vec![item],
            |_| {
                uploaded += 1;
                Ok(())
            },
            |_| {
                present += 1;
                Ok(())
            },
            |_| Ok(()),
        )
        .await
        .expect("ensure_uploaded");

    // The probe ran so "would upload" counts stay accurate, but no
    // write went out.
    assert_eq!((uploaded, present), (1, 0));

    let publish = client.new_publish(&token).await.expect("new publish");
    assert_eq!(publish.id(), "abcd1234");
    publish
        .add_items(
            &token,
            &[ItemInput {
                web_uri: "/dest/content".to_string(),
                object_key: key.clone(),
                ..Default::default()
            }],
        )
        .await
        .expect("add items");
    publish.commit(&token).await.expect("commit");

    let inner = gw.state.lock();
    assert_eq!(inner.head_probes, vec![key]);
    assert!(inner.uploads.is_empty());
    assert!(inner.created.is_empty());
    assert!(inner.items.is_empty());
    assert!(inner.commits.is_empty());
}

#[tokio::test]
async fn cancelled_token_aborts_uploads() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    let item = item_for(&dir, "content", b"some content\n");
    let token = CancellationToken::new();
    token.cancel();

    let err = client
        .ensure_uploaded(&token, vec![item], |_| Ok(()), |_| Ok(()), |_| Ok(()))
        .await
        .expect_err("cancelled context is an error");

    assert!(matches!(err, GwError::Cancelled), "got {err:?}");
}

/// The distinct-key invariant holds regardless of worker count: one
/// PUT per distinct missing key, one callback per item.
#[tokio::test]
async fn upload_invariants_hold_across_thread_counts() {
    for threads in [1usize, 2, 8] {
        let gw = spawn_gateway().await;
        let dir = TempDir::new().expect("tempdir");
        let cfg = load_config(&dir, &gw, &format!("uploadthreads: {threads}\n"));
        let client = client_for(&cfg, false);

        // Ten items over three distinct contents, one of them already
        // present server-side.
        let mut items = Vec::new();
        for i in 0..10 {
            let content = format!("content-{}\n", i % 3);
            items.push(item_for(&dir, &format!("file-{i}"), content.as_bytes()));
        }
        let present_key = sha256_hex(b"content-2\n");
        gw.state.lock().blobs.insert(present_key.clone());

        let (mut uploaded, mut present, mut duplicate) = (0, 0, 0);
        let token = CancellationToken::new();
        client
            .ensure_uploaded(
                &token,
                items.clone(),
                |_| {
                    uploaded += 1;
                    Ok(())
                },
                |_| {
                    present += 1;
                    Ok(())
                },
                |_| {
                    duplicate += 1;
                    Ok(())
                },
            )
            .await
            .expect("ensure_uploaded");

        // Every item lands in exactly one bucket.
        assert_eq!(uploaded + present + duplicate, items.len());
        assert_eq!((uploaded, present), (2, 1), "threads = {threads}");
        assert_eq!(duplicate, 7, "threads = {threads}");

        let inner = gw.state.lock();
        assert_eq!(inner.uploads.len(), 2, "threads = {threads}");
        let distinct: std::collections::HashSet<&str> =
            inner.uploads.iter().map(String::as_str).collect();
        assert_eq!(distinct.len(), 2, "threads = {threads}");
        assert!(!inner.uploads.contains(&present_key));
    }
}

/// A transport error while polling the commit task propagates out of
/// commit.
#[tokio::test]
async fn task_poll_transport_error_fails_commit() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "gwmaxattempts: 1\n");
    let client = client_for(&cfg, false);

    gw.state.lock().task_poll_status = 400;

    let token = CancellationToken::new();
    let publish = client.new_publish(&token).await.expect("new publish");
    let err = publish.commit(&token).await.expect_err("commit should fail");

    assert!(matches!(err, GwError::TaskFailed(_) | GwError::TaskPoll { .. }), "got {err:?}");
}

/// Commit polls until the task leaves its non-terminal states.
#[tokio::test]
async fn commit_polls_through_in_progress_states() {
    let gw = spawn_gateway().await;
    let dir = TempDir::new().expect("tempdir");
    let cfg = load_config(&dir, &gw, "");
    let client = client_for(&cfg, false);

    gw.state.lock().polls_before_done = 5;

    let token = CancellationToken::new();
    let publish = client.new_publish(&token).await.expect("new publish");
    publish.commit(&token).await.expect("commit");

    assert_eq!(gw.state.lock().polls_before_done, 0);
}
