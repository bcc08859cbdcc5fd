//! Source tree walking.
//!
//! Walks the directory tree for a publish and produces one [`SyncItem`]
//! per eligible file, with the content key (SHA-256) computed by a pool
//! of hashing workers. Directory scanning runs in a single producer;
//! hashing fans out over a bounded channel.

mod filter;

pub use filter::{Matcher, PatternError};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::args::Args;
use crate::webpath;

/// Number of concurrent hashing workers.
const HASH_WORKERS: usize = 20;

/// File metadata carried on sync items for logging purposes only.
#[derive(Debug, Clone, Default)]
pub struct ItemInfo {
    pub size: u64,
    pub mode: u32,
    pub mtime: Option<SystemTime>,
}

impl ItemInfo {
    fn from_metadata(meta: &std::fs::Metadata) -> ItemInfo {
        use std::os::unix::fs::PermissionsExt;

        ItemInfo {
            size: meta.len(),
            mode: meta.permissions().mode(),
            mtime: meta.modified().ok(),
        }
    }
}

/// A single item (file or symlink) to be included in a publish.
///
/// Exactly one of `key` and `link_to` is non-empty: regular files carry
/// the lowercase hex SHA-256 of their content, unresolved symlinks carry
/// their target.
#[derive(Debug, Clone, Default)]
pub struct SyncItem {
    pub src_path: String,
    pub key: String,
    pub link_to: String,
    pub info: ItemInfo,
}

/// Errors arising while walking the source tree.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum {path}: {source}")]
    Checksum {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resolving link {path}: {source}")]
    Link {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("walk cancelled")]
    Cancelled,

    /// An error returned by the item handler; stops the walk.
    #[error("{0}")]
    Handler(String),
}

enum RawItem {
    File { path: String, info: ItemInfo },
    Link { path: String, target: String, info: ItemInfo },
}

/// Walks the directory tree at `args.src` and invokes `handler` for
/// every discovered item eligible for sync.
///
/// Items arrive in no particular order. If the handler returns an
/// error, the walk stops and returns that error.
pub async fn walk<F>(
    token: &CancellationToken,
    args: &Args,
    only_these: &[String],
    mut handler: F,
) -> Result<(), WalkError>
where
    F: FnMut(SyncItem) -> Result<(), WalkError>,
{
    let matcher = Matcher::new(&args.excluded(), &args.included())?;
    debug!(path = %args.src, "start walking src tree");

    let (raw_tx, raw_rx) = mpsc::channel::<Result<RawItem, WalkError>>(10);
    let (out_tx, mut out_rx) = mpsc::channel::<Result<SyncItem, WalkError>>(10);

    let stage_token = token.child_token();

    let producer = {
        let token = stage_token.clone();
        let src = args.src.clone();
        let links = args.links;
        let only: HashSet<String> = only_these.iter().map(|p| webpath::clean(p)).collect();
        tokio::task::spawn_blocking(move || scan_tree(&token, &src, &matcher, &only, links, &raw_tx))
    };

    let raw_rx = Arc::new(Mutex::new(raw_rx));
    let mut workers = Vec::with_capacity(HASH_WORKERS);
    for _ in 0..HASH_WORKERS {
        workers.push(tokio::spawn(fill_items(
            stage_token.clone(),
            raw_rx.clone(),
            out_tx.clone(),
        )));
    }
    drop(raw_rx);
    drop(out_tx);

    let mut result = Ok(());
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => {
                result = Err(WalkError::Cancelled);
                break;
            }
            msg = out_rx.recv() => msg,
        };

        let Some(msg) = msg else { break };

        match msg {
            Err(err) => {
                result = Err(err);
                break;
            }
            Ok(item) => {
                debug!(path = %item.src_path, key = %item.key, "got item");
                if let Err(err) = handler(item) {
                    result = Err(err);
                    break;
                }
            }
        }
    }

    // Unblock both stages on early exit, then wait for them so no task
    // outlives the walk.
    stage_token.cancel();
    drop(out_rx);
    let _ = producer.await;
    for worker in workers {
        let _ = worker.await;
    }

    if result.is_ok() && token.is_cancelled() {
        result = Err(WalkError::Cancelled);
    }
    result
}

/// The scan stage: enumerates the tree, applies --files-from and filter
/// rules, and forwards raw entries to the hashing workers.
///
/// Runs on a blocking thread; sends block when the channel is full.
fn scan_tree(
    token: &CancellationToken,
    src: &str,
    matcher: &Matcher,
    only_these: &HashSet<String>,
    links: bool,
    tx: &mpsc::Sender<Result<RawItem, WalkError>>,
) {
    // The path filtered is relative to the source root.
    let src_prefix = webpath::clean(&format!("{src}/"));
    let mut emitted: HashSet<String> = HashSet::new();

    let mut it = walkdir::WalkDir::new(src)
        .follow_links(!links)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = it.next() {
        if token.is_cancelled() {
            let _ = tx.blocking_send(Err(WalkError::Cancelled));
            return;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| src.to_string());
                let source = err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
                let _ = tx.blocking_send(Err(WalkError::Read { path, source }));
                return;
            }
        };

        let path = entry.path().to_string_lossy().to_string();

        if !only_these.is_empty() && !only_these.contains(&webpath::clean(&path)) {
            debug!(path, "skipping; not included in --files-from file");
            continue;
        }

        let clean_path = webpath::clean(&path);
        let rel = clean_path
            .strip_prefix(src_prefix.as_str())
            .unwrap_or(&clean_path);

        let is_dir = entry.file_type().is_dir();
        if !matcher.keep(rel, is_dir) {
            if is_dir {
                it.skip_current_dir();
            }
            continue;
        }

        if is_dir {
            // Nothing to do.
            continue;
        }

        if !emitted.insert(path.clone()) {
            continue;
        }

        let item = if links && entry.path_is_symlink() {
            let target = match std::fs::read_link(entry.path()) {
                Ok(target) => target.to_string_lossy().to_string(),
                Err(source) => {
                    let _ = tx.blocking_send(Err(WalkError::Link { path, source }));
                    return;
                }
            };
            let info = match entry.metadata() {
                Ok(meta) => ItemInfo::from_metadata(&meta),
                Err(err) => {
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("stat failed"));
                    let _ = tx.blocking_send(Err(WalkError::Read { path, source }));
                    return;
                }
            };
            RawItem::Link { path, target, info }
        } else {
            let info = match entry.metadata() {
                Ok(meta) => ItemInfo::from_metadata(&meta),
                Err(err) => {
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("stat failed"));
                    let _ = tx.blocking_send(Err(WalkError::Read { path, source }));
                    return;
                }
            };
            RawItem::File { path, info }
        };

        if tx.blocking_send(Ok(item)).is_err() {
            // Receiver gone; the walk is shutting down.
            return;
        }
    }
}

/// The hashing stage: consumes raw entries, computes content keys for
/// regular files, and forwards completed sync items.
async fn fill_items(
    token: CancellationToken,
    jobs: Arc<Mutex<mpsc::Receiver<Result<RawItem, WalkError>>>>,
    out: mpsc::Sender<Result<SyncItem, WalkError>>,
) {
    loop {
        let msg = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                _ = token.cancelled() => return,
                msg = rx.recv() => msg,
            }
        };

        let Some(msg) = msg else { return };

        match msg {
            Err(err) => {
                let _ = out.send(Err(err)).await;
                return;
            }
            Ok(RawItem::Link { path, target, info }) => {
                let item = SyncItem {
                    src_path: path,
                    key: String::new(),
                    link_to: target,
                    info,
                };
                if out.send(Ok(item)).await.is_err() {
                    return;
                }
            }
            Ok(RawItem::File { path, info }) => {
                let result = match hash_file(&token, &path).await {
                    Ok(key) => Ok(SyncItem {
                        src_path: path,
                        key,
                        link_to: String::new(),
                        info,
                    }),
                    Err(err) => Err(err),
                };
                let failed = result.is_err();
                if out.send(result).await.is_err() || failed {
                    return;
                }
            }
        }
    }
}

/// Computes the lowercase hex SHA-256 of a file's content by streaming.
async fn hash_file(token: &CancellationToken, path: &str) -> Result<String, WalkError> {
    use sha2::{Digest, Sha256};

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| WalkError::Checksum {
            path: path.to_string(),
            source,
        })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        if token.is_cancelled() {
            return Err(WalkError::Cancelled);
        }

        let n = file
            .read(&mut buf)
            .await
            .map_err(|source| WalkError::Checksum {
                path: path.to_string(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
