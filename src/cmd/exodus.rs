//! The exodus publish pipeline: walk, upload, publish, commit.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::args::Args;
use crate::conf::Config;
use crate::gw::{Client, ItemInput};
use crate::walk::{self, SyncItem, WalkError};
use crate::webpath;

/// If the configured strip string contains `:`, the path following the
/// `:` is removed from the front of the destination path.
///
/// For example, publishing to `otherhost:/foo/bar/baz/my/dest` with
/// `strip: otherhost:/foo` configured publishes under
/// `/bar/baz/my/dest`.
fn clean_dest_tree(dest_tree: &str, strip: &str) -> String {
    if let Some((_, strip_path)) = strip.split_once(':') {
        if let Some(rest) = dest_tree.strip_prefix(strip_path) {
            return rest.to_string();
        }
    }
    dest_tree.to_string()
}

fn rel_path(src_path: &str, src_tree: &str) -> String {
    let clean_path = webpath::clean(src_path);
    let clean_tree = webpath::clean(src_tree);
    match clean_path.strip_prefix(&format!("{clean_tree}/")) {
        Some(rel) => rel.to_string(),
        None => clean_path,
    }
}

/// Computes the destination URI for a source path.
///
/// The presence of a trailing slash on the source changes how
/// destination paths are assembled, following rsync's treatment of
/// trailing slashes: without one, the source directory itself is
/// recreated under the destination.
fn web_uri(src_path: &str, src_tree: &str, dest_tree: &str, src_is_dir: bool) -> String {
    let rel = rel_path(src_path, src_tree);

    if src_tree != "." && !src_tree.ends_with('/') {
        let src_base = webpath::base(src_tree);
        if src_is_dir {
            return webpath::join(&[dest_tree, &src_base, &rel]);
        }
        return dest_tree.to_string();
    }

    webpath::join(&[dest_tree, &rel])
}

/// Runs the gateway-only publish pipeline and returns an exit code.
pub(crate) async fn exodus_main(token: &CancellationToken, cfg: &dyn Config, args: &Args) -> i32 {
    let __t0 = std::time::Instant::now();
    eprintln!("exodus_main start");
    let client = match Client::new(cfg, args.dry_run) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "can't initialize exodus-gw client");
            return 101;
        }
    };

    let mut args = args.clone();
    let mut only_these: Vec<String> = Vec::new();

    if let Some(files_from) = args.files_from.clone() {
        args.relative = true;

        // With --files-from we don't want to recreate the source
        // directory itself; a trailing slash selects only its contents.
        if !args.src.ends_with('/') {
            args.src.push('/');
        }

        let content = match tokio::fs::read_to_string(&files_from).await {
            Ok(content) => content,
            Err(err) => {
                error!(src = %args.src, error = %err, "can't read --files-from file");
                return 73;
            }
        };
        for line in content.lines() {
            let line = line.trim();
            if !line.is_empty() {
                only_these.push(webpath::join(&[&args.src, line]));
            }
        }
    }

    let src_is_dir = match tokio::fs::metadata(&args.src).await {
        Ok(meta) => meta.is_dir(),
        Err(err) => {
            error!(error = %err, "can't stat file");
            return 73;
        }
    };

    let mut items: Vec<SyncItem> = Vec::new();
    let ignore_existing = args.ignore_existing;
    let walked = walk::walk(token, &args, &only_these, |item| {
        if ignore_existing {
            // This argument is not (properly) supported. It is only
            // checked once an item has actually been found, so that a
            // run over a tree with no files still succeeds; some tools
            // sync an empty directory this way as a "remote mkdir",
            // which is a safe no-op here since directories don't exist
            // in the target. Anything more is an error, as the real
            // semantics can't be delivered.
            return Err(WalkError::Handler(
                "--ignore-existing is not supported".to_string(),
            ));
        }
        items.push(item);
        Ok(())
    })
    .await;

    if let Err(err) = walked {
        error!(src = %args.src, error = %err, "can't read files for sync");
        return 73;
    }

    let mut uploaded = 0usize;
    let mut existing = 0usize;
    let mut duplicate = 0usize;

    let upload_result = client
        .ensure_uploaded(
            token,
            items.clone(),
            |_| {
                uploaded += 1;
                Ok(())
            },
            |_| {
                existing += 1;
                Ok(())
            },
            |_| {
                duplicate += 1;
                Ok(())
            },
        )
        .await;

    eprintln!("after ensure_uploaded: {:?}", __t0.elapsed());
    if let Err(err) = upload_result {
        error!(error = %err, "can't upload files");
        return 25;
    }

    info!(uploaded, existing, duplicate, "Completed uploads");

    let publish = match &args.exodus_publish {
        None => match client.new_publish(token).await {
            Ok(publish) => {
                info!(publish = %publish.id(), "Created publish");
                publish
            }
            Err(err) => {
                error!(error = %err, "can't create publish");
                return 62;
            }
        },
        Some(id) => {
            let publish = client.get_publish(id);
            info!(publish = %publish.id(), "Joining publish");
            publish
        }
    };

    let dest_tree = clean_dest_tree(&args.dest_path(), cfg.strip());

    let mut publish_items: Vec<ItemInput> = Vec::with_capacity(items.len());
    for item in &items {
        let mut gw_item = ItemInput {
            web_uri: web_uri(&item.src_path, &args.src, &dest_tree, src_is_dir),
            ..Default::default()
        };

        if !item.link_to.is_empty() {
            // Rewrite the link target to an absolute path within the
            // destination tree, preserving relative-link semantics.
            let link_dir = webpath::dir(&rel_path(&item.src_path, &args.src));
            gw_item.link_to = webpath::join(&[&dest_tree, &link_dir, &item.link_to]);
        } else {
            gw_item.object_key = item.key.clone();
        }

        publish_items.push(gw_item);
    }

    if let Err(err) = publish.add_items(token, &publish_items).await {
        error!(error = %err, "can't add items to publish");
        return 51;
    }

    info!(publish = %publish.id(), items = publish_items.len(), "Added publish items");

    if args.exodus_publish.is_none() {
        // We created the publish, so we commit it. A joined publish is
        // left for its owner to commit.
        if let Err(err) = publish.commit(token).await {
            error!(error = %err, "can't commit publish");
            return 71;
        }
    }

    if args.dry_run {
        info!("Completed successfully (in dry-run mode - no changes written)");
    } else {
        info!("Completed successfully!");
    }

    0
}
