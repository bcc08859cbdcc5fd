//! Configuration loading and environment resolution.
//!
//! Configuration is a YAML file with a set of global keys plus a list of
//! environments, each matched against the rsync destination by prefix.
//! Every environment key falls back to the global value when unset, so
//! the rest of the crate is polymorphic over "a configuration" via the
//! [`Config`] trait.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::args::Args;

/// Errors arising from configuration loading.
#[derive(Debug, Error)]
pub enum ConfError {
    /// No config file was found at any candidate path. Callers treat
    /// this as "run plain rsync" rather than a fatal error.
    #[error("no existing config file in: {}", .candidates.join(", "))]
    Missing { candidates: Vec<String> },

    #[error("can't read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot strip '{strip}' prefix from '{prefix}'")]
    BadStrip { strip: String, prefix: String },

    #[error("duplicate environment definitions for '{0}'")]
    DuplicatePrefix(String),
}

impl ConfError {
    /// True if the error only means that no config file exists.
    pub fn is_missing(&self) -> bool {
        matches!(self, ConfError::Missing { .. })
    }
}

/// Keys settable both globally and per environment. Zero values mean
/// "unset" and fall back to the parent (or built-in) value.
#[derive(Debug, Clone, Default, Deserialize)]
struct SharedKeys {
    #[serde(default)]
    gwenv: String,
    #[serde(default)]
    gwcert: String,
    #[serde(default)]
    gwkey: String,
    #[serde(default)]
    gwurl: String,
    #[serde(default)]
    gwpollinterval: u64,
    #[serde(default)]
    gwbatchsize: usize,
    #[serde(default)]
    gwcommit: String,
    #[serde(default)]
    gwmaxattempts: u32,
    #[serde(default)]
    gwmaxbackoff: u64,
    #[serde(default)]
    rsyncmode: String,
    #[serde(default)]
    loglevel: String,
    #[serde(default)]
    logger: String,
    #[serde(default)]
    diag: bool,
    #[serde(default)]
    strip: String,
    #[serde(default)]
    uploadthreads: usize,
}

/// One environment entry from the config file.
#[derive(Debug, Clone, Default, Deserialize)]
struct EnvironmentRaw {
    #[serde(flatten)]
    shared: SharedKeys,

    #[serde(default)]
    prefix: String,
}

/// Parsed content of an exodus-rsync configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalConfig {
    #[serde(flatten)]
    shared: SharedKeys,

    #[serde(default)]
    environments: Vec<EnvironmentRaw>,

    // Carried over from the command line at load time so that the
    // Config trait can expose them uniformly.
    #[serde(skip)]
    verbose: u8,
    #[serde(skip)]
    diag_flag: bool,
}

/// A view of an environment entry which resolves every getter as "own
/// value, else parent". Holds only references; the global config owns
/// all data.
#[derive(Debug, Clone, Copy)]
pub struct Environment<'a> {
    raw: &'a EnvironmentRaw,
    parent: &'a GlobalConfig,
}

/// The capability set shared by global and environment configuration.
pub trait Config: Send + Sync {
    fn gw_cert(&self) -> &str;
    fn gw_key(&self) -> &str;
    fn gw_url(&self) -> &str;
    fn gw_env(&self) -> &str;
    /// Task poll interval, in milliseconds.
    fn gw_poll_interval(&self) -> u64;
    fn gw_batch_size(&self) -> usize;
    /// Commit mode forwarded to exodus-gw, empty for the server default.
    fn gw_commit(&self) -> &str;
    fn gw_max_attempts(&self) -> u32;
    /// Retry backoff cap, in milliseconds.
    fn gw_max_backoff(&self) -> u64;
    fn rsync_mode(&self) -> &str;
    fn log_level(&self) -> &str;
    fn logger(&self) -> &str;
    fn verbosity(&self) -> u8;
    fn diag(&self) -> bool;
    fn strip(&self) -> &str;
    fn upload_threads(&self) -> usize;
    /// The matched environment prefix, if this view is an environment.
    fn prefix(&self) -> Option<&str> {
        None
    }
}

fn non_empty_str<'a>(own: &'a str, parent: &'a str) -> &'a str {
    if own.is_empty() {
        parent
    } else {
        own
    }
}

fn non_zero_u64(own: u64, parent: u64) -> u64 {
    if own != 0 {
        own
    } else {
        parent
    }
}

impl Config for GlobalConfig {
    fn gw_cert(&self) -> &str {
        &self.shared.gwcert
    }

    fn gw_key(&self) -> &str {
        &self.shared.gwkey
    }

    fn gw_url(&self) -> &str {
        &self.shared.gwurl
    }

    fn gw_env(&self) -> &str {
        &self.shared.gwenv
    }

    fn gw_poll_interval(&self) -> u64 {
        non_zero_u64(self.shared.gwpollinterval, 5000)
    }

    fn gw_batch_size(&self) -> usize {
        if self.shared.gwbatchsize != 0 {
            self.shared.gwbatchsize
        } else {
            10_000
        }
    }

    fn gw_commit(&self) -> &str {
        &self.shared.gwcommit
    }

    fn gw_max_attempts(&self) -> u32 {
        if self.shared.gwmaxattempts != 0 {
            self.shared.gwmaxattempts
        } else {
            10
        }
    }

    fn gw_max_backoff(&self) -> u64 {
        non_zero_u64(self.shared.gwmaxbackoff, 20_000)
    }

    fn rsync_mode(&self) -> &str {
        non_empty_str(&self.shared.rsyncmode, "exodus")
    }

    fn log_level(&self) -> &str {
        non_empty_str(&self.shared.loglevel, "info")
    }

    fn logger(&self) -> &str {
        non_empty_str(&self.shared.logger, "auto")
    }

    fn verbosity(&self) -> u8 {
        self.verbose
    }

    fn diag(&self) -> bool {
        self.shared.diag || self.diag_flag
    }

    fn strip(&self) -> &str {
        &self.shared.strip
    }

    fn upload_threads(&self) -> usize {
        if self.shared.uploadthreads != 0 {
            self.shared.uploadthreads
        } else {
            4
        }
    }
}

impl Config for Environment<'_> {
    fn gw_cert(&self) -> &str {
        non_empty_str(&self.raw.shared.gwcert, self.parent.gw_cert())
    }

    fn gw_key(&self) -> &str {
        non_empty_str(&self.raw.shared.gwkey, self.parent.gw_key())
    }

    fn gw_url(&self) -> &str {
        non_empty_str(&self.raw.shared.gwurl, self.parent.gw_url())
    }

    fn gw_env(&self) -> &str {
        non_empty_str(&self.raw.shared.gwenv, self.parent.gw_env())
    }

    fn gw_poll_interval(&self) -> u64 {
        non_zero_u64(self.raw.shared.gwpollinterval, self.parent.gw_poll_interval())
    }

    fn gw_batch_size(&self) -> usize {
        if self.raw.shared.gwbatchsize != 0 {
            self.raw.shared.gwbatchsize
        } else {
            self.parent.gw_batch_size()
        }
    }

    fn gw_commit(&self) -> &str {
        non_empty_str(&self.raw.shared.gwcommit, self.parent.gw_commit())
    }

    fn gw_max_attempts(&self) -> u32 {
        if self.raw.shared.gwmaxattempts != 0 {
            self.raw.shared.gwmaxattempts
        } else {
            self.parent.gw_max_attempts()
        }
    }

    fn gw_max_backoff(&self) -> u64 {
        non_zero_u64(self.raw.shared.gwmaxbackoff, self.parent.gw_max_backoff())
    }

    fn rsync_mode(&self) -> &str {
        non_empty_str(&self.raw.shared.rsyncmode, self.parent.rsync_mode())
    }

    fn log_level(&self) -> &str {
        non_empty_str(&self.raw.shared.loglevel, self.parent.log_level())
    }

    fn logger(&self) -> &str {
        non_empty_str(&self.raw.shared.logger, self.parent.logger())
    }

    fn verbosity(&self) -> u8 {
        self.parent.verbosity()
    }

    fn diag(&self) -> bool {
        self.raw.shared.diag || self.parent.diag()
    }

    /// The strip prefix for an environment: own value, else the global
    /// value, else the environment's own prefix.
    fn strip(&self) -> &str {
        let inherited = non_empty_str(&self.raw.shared.strip, self.parent.strip());
        non_empty_str(inherited, &self.raw.prefix)
    }

    fn upload_threads(&self) -> usize {
        if self.raw.shared.uploadthreads != 0 {
            self.raw.shared.uploadthreads
        } else {
            self.parent.upload_threads()
        }
    }

    fn prefix(&self) -> Option<&str> {
        Some(&self.raw.prefix)
    }
}

fn candidate_paths(args: &Args) -> Vec<PathBuf> {
    if let Some(forced) = &args.exodus_conf {
        return vec![forced.clone()];
    }

    let mut out = vec![PathBuf::from("exodus-rsync.conf")];
    if let Some(config_home) = dirs::config_dir() {
        out.push(config_home.join("exodus-rsync.conf"));
    }
    out.push(PathBuf::from("/etc/exodus-rsync.conf"));
    out
}

/// Expands `$VAR` and `${VAR}` references from the process environment.
/// Undefined variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_ascii_alphanumeric() || ch == '_' {
                    name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if name.is_empty() {
            out.push('$');
        } else if let Ok(value) = std::env::var(&name) {
            out.push_str(&value);
        }
    }

    out
}

fn load_from_path(path: &Path, args: &Args) -> Result<GlobalConfig, ConfError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out: GlobalConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    out.verbose = args.verbose;
    out.diag_flag = args.exodus_diag;

    // A bit of normalization...
    while out.shared.gwurl.ends_with('/') {
        out.shared.gwurl.pop();
    }

    // A few vars support env var expansion for convenience.
    out.shared.gwcert = expand_env(&out.shared.gwcert);
    out.shared.gwkey = expand_env(&out.shared.gwkey);
    out.shared.gwurl = expand_env(&out.shared.gwurl);
    out.shared.gwenv = expand_env(&out.shared.gwenv);

    let mut prefixes = HashSet::new();
    for env in &out.environments {
        if !env.prefix.starts_with(&out.shared.strip) {
            return Err(ConfError::BadStrip {
                strip: out.shared.strip.clone(),
                prefix: env.prefix.clone(),
            });
        }
        if !prefixes.insert(env.prefix.clone()) {
            return Err(ConfError::DuplicatePrefix(env.prefix.clone()));
        }
    }

    Ok(out)
}

/// Loads configuration from the most appropriate config file: the path
/// forced by `--exodus-conf`, else `./exodus-rsync.conf`, the XDG config
/// directory, then `/etc/exodus-rsync.conf`.
pub fn load(args: &Args) -> Result<GlobalConfig, ConfError> {
    let candidates = candidate_paths(args);

    for candidate in &candidates {
        if candidate.exists() {
            debug!(path = %candidate.display(), "loading config");
            return load_from_path(candidate, args);
        }
        debug!(path = %candidate.display(), "config file not usable");
    }

    Err(ConfError::Missing {
        candidates: candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    })
}

impl GlobalConfig {
    /// Finds the environment matching the given rsync destination, or
    /// `None` if no environment matches. The longest matching prefix
    /// wins; a prefix without `:` is matched with `:` appended.
    pub fn environment_for_dest(&self, dest: &str) -> Option<Environment<'_>> {
        let mut best: Option<(&EnvironmentRaw, usize)> = None;

        for raw in &self.environments {
            let mut prefix = raw.prefix.clone();
            if !prefix.contains(':') {
                prefix.push(':');
            }
            if dest.starts_with(&prefix) && best.is_none_or(|(_, len)| prefix.len() > len) {
                best = Some((raw, prefix.len()));
            }
        }

        if best.is_none() {
            debug!(dest, "no matching environment in config");
        }

        best.map(|(raw, _)| Environment { raw, parent: self })
    }
}
