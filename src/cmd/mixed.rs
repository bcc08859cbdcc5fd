//! Mixed publish mode: publish via both exodus-gw and rsync at once.
//!
//! If either side fails, the other is cancelled. The ordering of the
//! final log lines is deliberate: if we just let cancellation and
//! return happen naturally, the last messages would describe the
//! cancellation of the surviving side, and a reader would likely blame
//! the wrong component. Instead the causal error is always logged last.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::exodus::exodus_main;
use crate::args::Args;
use crate::conf::GlobalConfig;
use crate::rsync;

pub(crate) async fn mixed_main(token: &CancellationToken, cfg: GlobalConfig, args: Args) -> i32 {
    let cmd = match rsync::command(&args) {
        Ok(cmd) => cmd,
        Err(err) => {
            error!(error = %err, "Failed to generate rsync command");
            return 25;
        }
    };

    supervise(token, cmd, cfg, args).await
}

/// Runs the rsync command and the exodus publish concurrently under a
/// shared cancellable token, returning the combined exit code.
pub(crate) async fn supervise(
    token: &CancellationToken,
    cmd: tokio::process::Command,
    cfg: GlobalConfig,
    args: Args,
) -> i32 {
    let mixed = token.child_token();

    let (exodus_tx, mut exodus_rx) = mpsc::channel::<i32>(1);
    let (rsync_tx, mut rsync_rx) = mpsc::channel::<i32>(1);

    {
        let token = mixed.clone();
        let args = args.clone();
        tokio::spawn(async move {
            let code = match cfg.environment_for_dest(&args.dest) {
                Some(env) => exodus_main(&token, &env, &args).await,
                None => exodus_main(&token, &cfg, &args).await,
            };
            let _ = exodus_tx.send(code).await;
        });
    }

    {
        let token = mixed.clone();
        tokio::spawn(async move {
            let _ = rsync_tx.send(rsync::run_command(&token, cmd).await).await;
        });
    }

    tokio::select! {
        code = exodus_rx.recv() => {
            let code = code.unwrap_or(25);
            if code != 0 {
                warn!("Cancelling rsync due to errors in exodus publish...");
                mixed.cancel();
                let _ = rsync_rx.recv().await;
                error!("Publish via exodus-gw failed");
                return code;
            }
            info!("Finished exodus publish, waiting on rsync...");
            rsync_rx.recv().await.unwrap_or(130)
        }
        code = rsync_rx.recv() => {
            let code = code.unwrap_or(130);
            if code != 0 {
                warn!("Cancelling exodus publish due to errors in rsync...");
                mixed.cancel();
                let _ = exodus_rx.recv().await;
                error!("Publish via rsync failed");
                return code;
            }
            info!("Finished rsync publish, waiting on exodus...");
            exodus_rx.recv().await.unwrap_or(25)
        }
    }
}
