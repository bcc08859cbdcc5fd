//! The top-level command: mode dispatch and exit-code mapping.
//!
//! Depending on configuration and the destination argument, a run is
//! either handed entirely to the real rsync, published through
//! exodus-gw, or both at once (mixed mode).

mod exodus;
mod mixed;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::args::Args;
use crate::conf::{self, Config};
use crate::{diag, rsync};

/// Initializes the global tracing subscriber. The base level comes from
/// configuration; -v raises it to debug, -vv and beyond to trace.
/// Safe to call more than once; only the first call takes effect.
pub(crate) fn init_logging(level: &str, verbose: u8) {
    let level = match verbose {
        0 => level,
        1 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn rsync_main(args: &Args) -> i32 {
    // Just run rsync. In the successful case, since we're doing an
    // execve system call, this never returns.
    let err = rsync::exec(args);
    error!(error = %err, "can't exec rsync");
    94
}

fn rsync_raw(raw_args: &[String]) -> i32 {
    // Trim the command name from raw argv and hand everything else to
    // rsync unchanged.
    let err = rsync::raw_exec(&raw_args[1..]);
    error!(error = %err, "can't exec rsync");
    94
}

/// The top-level entry point. Takes the raw argument vector (including
/// argv[0]) and returns the process exit code.
pub async fn run(raw_args: Vec<String>) -> i32 {
    // When invoked by a remote peer as the server or sender side of a
    // real transfer, skip all parsing and pass through.
    if raw_args
        .iter()
        .skip(1)
        .any(|arg| arg == "--server" || arg == "--sender")
    {
        init_logging("info", 0);
        return rsync_raw(&raw_args);
    }

    let args = match Args::try_parse_from_argv(&raw_args) {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return err.exit_code();
        }
    };

    let cfg = match conf::load(&args) {
        Ok(cfg) => cfg,
        Err(err) if err.is_missing() => {
            init_logging("info", args.verbose);
            debug!(error = %err, "no config file; handing off to rsync");
            return rsync_main(&args);
        }
        Err(err) => {
            init_logging("info", args.verbose);
            error!(error = %err, "can't load config");
            return 23;
        }
    };

    init_logging(cfg.log_level(), args.verbose);

    let token = CancellationToken::new();
    let env = cfg.environment_for_dest(&args.dest);

    let want_diag = match &env {
        Some(env) => env.diag(),
        None => cfg.diag(),
    };
    if want_diag {
        match &env {
            Some(env) => diag::run(&token, env, &args).await,
            None => diag::run(&token, &cfg, &args).await,
        }
    }

    match &env {
        None => rsync_main(&args),
        Some(env) => match env.rsync_mode() {
            "rsync" => rsync_main(&args),
            "exodus" => exodus::exodus_main(&token, env, &args).await,
            "mixed" => mixed::mixed_main(&token, cfg.clone(), args.clone()).await,
            mode => {
                error!(mode, "invalid rsyncmode in configuration");
                95
            }
        },
    }
}
