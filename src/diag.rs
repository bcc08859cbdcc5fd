//! Diagnostics dump.
//!
//! Emits an extensive snapshot of the effective configuration, the
//! command, the source tree, and the gateway identity. Diagnostics
//! never fail; this runs purely for the side effect of generating
//! user-oriented logs, so everything lands at warning level or above to
//! survive any log-level setting.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::args::Args;
use crate::conf::Config;
use crate::gw::Client;
use crate::rsync;

/// Runs the diagnostics dump.
pub async fn run(token: &CancellationToken, cfg: &dyn Config, args: &Args) {
    log_config(cfg);
    log_command(cfg, args);
    log_filters(args);
    log_srctree(args);
    log_gw(token, cfg).await;

    warn!("=============== diagnostics: end ====================");
}

fn log_config(cfg: &dyn Config) {
    warn!("=============== diagnostics: config =================");

    warn!(
        gwcert = cfg.gw_cert(),
        gwkey = cfg.gw_key(),
        gwurl = cfg.gw_url(),
        gwenv = cfg.gw_env(),
        gwpollinterval = cfg.gw_poll_interval(),
        gwbatchsize = cfg.gw_batch_size(),
        gwmaxattempts = cfg.gw_max_attempts(),
        gwmaxbackoff = cfg.gw_max_backoff(),
        "exodus-gw"
    );

    warn!(
        loglevel = cfg.log_level(),
        logger = cfg.logger(),
        verbosity = cfg.verbosity(),
        "logging"
    );

    debug!("This is a DEBUG log.");
    info!("This is an INFO log.");
    warn!("This is a WARNING log.");
    error!("This is an ERROR log.");
}

fn log_command(cfg: &dyn Config, args: &Args) {
    warn!("=============== diagnostics: command ================");

    let prefix = cfg.prefix().unwrap_or("<no prefix matched in config>");

    warn!(
        prefix,
        strip = cfg.strip(),
        rsyncmode = cfg.rsync_mode(),
        src = %args.src,
        dest = %args.dest,
        "command"
    );

    warn!(argv = ?rsync::arguments(args), "equivalent rsync command");
}

fn log_filters(args: &Args) {
    warn!("=============== diagnostics: filters ================");

    warn!(
        filter = ?args.filter,
        excluded = ?args.excluded(),
        included = ?args.included(),
        "filters"
    );
}

fn log_srctree(args: &Args) {
    warn!("=============== diagnostics: source tree ============");

    let mut files = 0usize;
    let mut dirs = 0usize;
    let mut total_bytes = 0u64;

    for entry in walkdir::WalkDir::new(&args.src).sort_by_file_name() {
        match entry {
            Ok(entry) => {
                let meta = entry.metadata().ok();
                let size = meta.as_ref().map(|m| m.len()).unwrap_or_default();
                if entry.file_type().is_dir() {
                    dirs += 1;
                } else {
                    files += 1;
                    total_bytes += size;
                }
                warn!(
                    path = %entry.path().display(),
                    size,
                    symlink = entry.path_is_symlink(),
                    "src tree entry"
                );
            }
            Err(err) => {
                error!(error = %err, "error reading source tree");
            }
        }
    }

    warn!(files, dirs, total_bytes, "source tree summary");
}

async fn log_gw(token: &CancellationToken, cfg: &dyn Config) {
    warn!("=============== diagnostics: exodus-gw ==============");

    // A dry-run client: diagnostics must not write anything.
    let client = match Client::new(cfg, true) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to create exodus-gw client");
            return;
        }
    };

    warn!("exodus-gw new client: OK");

    match client.whoami(token).await {
        Ok(identity) => {
            warn!(whoami = %identity, "exodus-gw request: OK");
        }
        Err(err) => {
            error!(error = %err, "exodus-gw request failed");
        }
    }
}
