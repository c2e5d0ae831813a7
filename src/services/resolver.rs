// Source Resolver Service
// Turns a remote video page URL into a direct media address

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Errors from remote-URL resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to run resolver: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Resolver exited with code {code}: {detail}")]
    Failed { code: i32, detail: String },

    #[error("Resolver produced no media address")]
    NoResult,

    #[error("Resolution cancelled")]
    Cancelled,
}

/// Converts a page URL (e.g. a video site link) into a direct address the
/// encoder can consume. Implementations must watch the cancel flag and bail
/// out promptly; the controller sets it when a stop request arrives while
/// resolution is still in flight.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, url: &str, cancel: &AtomicBool) -> Result<String, ResolveError>;
}

pub const RESOLVER_ENV_VAR: &str = "TELESTREAM_RESOLVER";

const DEFAULT_RESOLVER_BINARY: &str = "yt-dlp";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default resolver: shells out to a yt-dlp style binary and takes the first
/// non-empty line it prints as the direct media address.
pub struct YtDlpResolver {
    binary_path: String,
}

impl YtDlpResolver {
    /// Locate the resolver binary: env override first, then PATH lookup,
    /// falling back to the bare name so a failed spawn stays descriptive.
    pub fn new() -> Self {
        let binary_path = match std::env::var(RESOLVER_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => {
                log::info!("Using resolver from {RESOLVER_ENV_VAR}: {path}");
                path
            }
            _ => match which::which(DEFAULT_RESOLVER_BINARY) {
                Ok(path) => path.to_string_lossy().to_string(),
                Err(_) => DEFAULT_RESOLVER_BINARY.to_string(),
            },
        };
        Self { binary_path }
    }

    /// Use an explicit resolver binary
    pub fn with_binary_path(path: String) -> Self {
        Self { binary_path: path }
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceResolver for YtDlpResolver {
    fn resolve(&self, url: &str, cancel: &AtomicBool) -> Result<String, ResolveError> {
        log::info!("Resolving remote source via {}", self.binary_path);

        let mut child = Command::new(&self.binary_path)
            .arg("-g")
            .arg("--no-playlist")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Collect both pipes off-thread; yt-dlp can be chatty on stderr and
        // a full pipe would wedge the exit-poll loop below.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let mut cancelled = false;
        let status = loop {
            if cancel.load(Ordering::SeqCst) && !cancelled {
                cancelled = true;
                log::info!("Resolution cancelled, killing resolver process");
                let _ = child.kill();
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ResolveError::Spawn(e));
                }
            }
        };

        let output = stdout_reader.join().unwrap_or_default();
        let errors = stderr_reader.join().unwrap_or_default();

        if cancelled {
            return Err(ResolveError::Cancelled);
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let detail = errors
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no further detail")
                .to_string();
            log::warn!("Resolver failed with code {code}: {detail}");
            return Err(ResolveError::Failed { code, detail });
        }

        match output.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(address) => {
                log::info!("Resolved remote source to a direct media address");
                Ok(address.to_string())
            }
            None => Err(ResolveError::NoResult),
        }
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut content = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut content);
    }
    content
}
