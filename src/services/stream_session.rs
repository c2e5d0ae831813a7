// StreamSession Service
// Launches, supervises, and tears down the external encoder process

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{SessionConfig, SessionState, StatusReport, StreamSource};
use crate::services::{ConfigManager, ResolveError, SourceResolver, YtDlpResolver};

/// Errors from session control
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid config: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("A streaming session is already active")]
    AlreadyRunning,

    #[error("No streaming session is active")]
    NotRunning,

    #[error("Failed to launch encoder: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Source resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("Encoder exited unexpectedly with code {code}")]
    ProcessExited { code: i32 },

    #[error("Start cancelled by stop request")]
    Cancelled,
}

pub const ENCODER_ENV_VAR: &str = "TELESTREAM_FFMPEG";

const DEFAULT_ENCODER_BINARY: &str = "ffmpeg";
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Message from the monitor threads, drained by poll_status
enum MonitorEvent {
    Line(String),
    Exited { code: Option<i32>, success: bool },
}

/// One run of the external encoder. Created fresh on every start request and
/// kept after reaching a terminal state so logs and exit details stay
/// inspectable until the next start replaces it.
struct StreamSession {
    id: Uuid,
    state: SessionState,
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<std::process::ChildStdin>,
    updates: Receiver<MonitorEvent>,
    stop_requested: Arc<AtomicBool>,
    log_buffer: Vec<String>,
    exit_code: Option<i32>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    fn new(id: Uuid, updates: Receiver<MonitorEvent>, stop_requested: Arc<AtomicBool>) -> Self {
        Self {
            id,
            state: SessionState::Starting,
            child: None,
            stdin: None,
            updates,
            stop_requested,
            log_buffer: Vec::new(),
            exit_code: None,
            error: None,
            started_at: None,
        }
    }
}

/// Supervises at most one external encoder process at a time.
///
/// All methods take `&self` and may be called from any thread; the session
/// slot mutex is what makes the single-session invariant hold. Output
/// capture and exit detection run on worker threads that communicate only
/// through a channel, so no public call ever blocks on child I/O.
pub struct SessionController {
    encoder_path: String,
    resolver: Box<dyn SourceResolver>,
    config_manager: Arc<ConfigManager>,
    grace_period: Duration,
    session: Mutex<Option<StreamSession>>,
}

impl SessionController {
    /// Create a controller persisting last-used values through
    /// `config_manager`. The encoder binary is discovered via the env
    /// override, then PATH.
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            encoder_path: find_encoder(),
            resolver: Box::new(YtDlpResolver::new()),
            config_manager,
            grace_period: DEFAULT_GRACE_PERIOD,
            session: Mutex::new(None),
        }
    }

    /// Use an explicit encoder binary instead of discovery
    pub fn with_encoder_path(mut self, path: String) -> Self {
        self.encoder_path = path;
        self
    }

    /// Replace the remote-URL resolver
    pub fn with_resolver(mut self, resolver: Box<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Override the graceful-stop grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Start a streaming session from `config`. Returns the encoder pid.
    ///
    /// Validates first, claims the single session slot, persists the stream
    /// key as last-used, resolves a remote source when needed, then spawns
    /// the encoder and attaches the output monitor.
    pub fn start(&self, config: &SessionConfig) -> Result<u32, SessionError> {
        let source = validate_config(config)?;

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (line_tx, line_rx) = channel();
        let id = Uuid::new_v4();

        {
            let mut slot = self.lock_session();
            if let Some(session) = slot.as_ref() {
                if !session.state.is_terminal() {
                    return Err(SessionError::AlreadyRunning);
                }
            }
            *slot = Some(StreamSession::new(id, line_rx, Arc::clone(&stop_requested)));
        }

        log::info!("Session {id}: starting");

        // The key was accepted by the operator; remember it even if the run
        // fails later.
        if let Err(e) = self
            .config_manager
            .set_last_stream_key(config.stream_key.trim())
        {
            log::warn!("Failed to persist last stream key: {e}");
        }

        let input = match source {
            StreamSource::LocalFile(path) => path.to_string_lossy().to_string(),
            StreamSource::RemoteUrl(url) => {
                match self.resolver.resolve(&url, &stop_requested) {
                    Ok(address) => address,
                    Err(ResolveError::Cancelled) => {
                        log::info!("Session {id}: start cancelled during resolution");
                        // stop() normally moved the state already; cover
                        // resolvers that cancel on their own.
                        let mut slot = self.lock_session();
                        if let Some(session) = slot.as_mut() {
                            if session.id == id && session.state == SessionState::Starting {
                                session.state = SessionState::Stopped;
                            }
                        }
                        return Err(SessionError::Cancelled);
                    }
                    Err(e) => {
                        let error = SessionError::Resolution(e);
                        self.fail_starting_session(id, error.to_string());
                        return Err(error);
                    }
                }
            }
        };

        let args = build_encoder_args(&input, &config.publish_url());
        log::info!(
            "Session {id}: launching {} {}",
            self.encoder_path,
            args.iter().map(|a| redact_line(a)).collect::<Vec<_>>().join(" ")
        );

        // Spawn under the slot lock so a concurrent stop() either cancels us
        // here or sees the child it has to shut down.
        let mut slot = self.lock_session();
        let session = match slot.as_mut() {
            Some(session) if session.id == id && session.state == SessionState::Starting => {
                session
            }
            _ => {
                log::info!("Session {id}: start cancelled before spawn");
                return Err(SessionError::Cancelled);
            }
        };

        let mut cmd = Command::new(&self.encoder_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = SessionError::Launch(e);
                let message = error.to_string();
                log::error!("Session {id}: {message}");
                session.state = SessionState::Failed;
                session.error = Some(message);
                return Err(error);
            }
        };

        let pid = child.id();
        session.stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(child));
        session.child = Some(Arc::clone(&child));
        session.started_at = Some(Utc::now());
        session.state = SessionState::Running;
        drop(slot);

        let stdout_tx = line_tx.clone();
        let stdout_reader = thread::spawn(move || {
            if let Some(stdout) = stdout {
                forward_lines(stdout, &stdout_tx);
            }
        });

        // Exit detection rides on the stderr reader: once both pipes hit
        // EOF the process is gone (or going), so reap it and queue the exit
        // event after every captured line.
        thread::spawn(move || {
            if let Some(stderr) = stderr {
                forward_lines(stderr, &line_tx);
            }
            let _ = stdout_reader.join();
            let event = match reap_child(&child) {
                Some(status) => MonitorEvent::Exited {
                    code: status.code(),
                    success: status.success(),
                },
                None => MonitorEvent::Exited {
                    code: None,
                    success: false,
                },
            };
            let _ = line_tx.send(event);
        });

        log::info!("Session {id}: encoder running (pid {pid})");
        Ok(pid)
    }

    /// Stop the active session.
    ///
    /// Graceful first: the encoder's quit command on stdin, then exit
    /// polling up to the grace period, then exactly one forced kill. Stop
    /// during startup cancels the pending start instead. Repeated calls
    /// while a stop is in flight are no-ops.
    pub fn stop(&self) -> Result<(), SessionError> {
        let (id, child, stdin) = {
            let mut slot = self.lock_session();
            let session = match slot.as_mut() {
                Some(session) => session,
                None => return Err(SessionError::NotRunning),
            };

            match session.state {
                SessionState::Starting => {
                    // No encoder process yet; flag the pending start. The
                    // resolver watches the flag and kills its own subprocess.
                    session.stop_requested.store(true, Ordering::SeqCst);
                    session.state = SessionState::Stopped;
                    log::info!("Session {}: stop requested during startup", session.id);
                    return Ok(());
                }
                SessionState::Running => {}
                SessionState::Stopping => return Ok(()),
                _ => return Err(SessionError::NotRunning),
            }

            session.stop_requested.store(true, Ordering::SeqCst);
            session.state = SessionState::Stopping;
            (session.id, session.child.clone(), session.stdin.take())
        };

        log::info!("Session {id}: stopping encoder");

        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q\n");
            let _ = stdin.flush();
        }

        let exit_code = match child {
            Some(child) => self.wait_or_kill(id, &child),
            None => None,
        };

        let mut slot = self.lock_session();
        if let Some(session) = slot.as_mut() {
            if session.id == id {
                session.state = SessionState::Stopped;
                if session.exit_code.is_none() {
                    session.exit_code = exit_code;
                }
                session.child = None;
            }
        }
        log::info!("Session {id}: stopped");

        Ok(())
    }

    /// Poll for exit up to the grace period, then force-kill once
    fn wait_or_kill(&self, id: Uuid, child: &Arc<Mutex<Child>>) -> Option<i32> {
        let start = Instant::now();
        while start.elapsed() < self.grace_period {
            let mut guard = lock_child(child);
            if let Ok(Some(status)) = guard.try_wait() {
                return status.code();
            }
            drop(guard);
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        log::warn!(
            "Session {id}: encoder ignored quit for {:?}, killing",
            self.grace_period
        );
        let mut guard = lock_child(child);
        let _ = guard.kill();
        match guard.wait() {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }

    /// Drain monitor output and return the current snapshot.
    ///
    /// Never blocks on the child: only what the monitor threads have already
    /// queued is read. Lines are appended to the session log in arrival
    /// order. An exit observed here is applied to the state machine unless
    /// the session is already terminal (a completed stop() wins).
    pub fn poll_status(&self) -> StatusReport {
        let mut slot = self.lock_session();
        let session = match slot.as_mut() {
            Some(session) => session,
            None => return StatusReport::idle(),
        };

        let mut new_lines = Vec::new();
        let mut exit = None;
        while let Ok(event) = session.updates.try_recv() {
            match event {
                MonitorEvent::Line(line) => new_lines.push(line),
                MonitorEvent::Exited { code, success } => exit = Some((code, success)),
            }
        }

        session.log_buffer.extend(new_lines.iter().cloned());

        if let Some((code, success)) = exit {
            // The process is gone; release the handle.
            session.child = None;
            session.stdin = None;
            session.exit_code = code;
            if !session.state.is_terminal() {
                if session.stop_requested.load(Ordering::SeqCst) {
                    log::info!("Session {}: encoder exited after stop request", session.id);
                    session.state = SessionState::Stopped;
                } else if success {
                    log::info!("Session {}: encoder finished cleanly", session.id);
                    session.state = SessionState::Stopped;
                } else {
                    let error = SessionError::ProcessExited {
                        code: code.unwrap_or(-1),
                    };
                    let message = error.to_string();
                    log::error!("Session {}: {message}", session.id);
                    if !session.log_buffer.is_empty() {
                        log::warn!("Session {}: last output lines:", session.id);
                        for line in session.log_buffer.iter().rev().take(10).rev() {
                            log::warn!("Session {}:   {line}", session.id);
                        }
                    }
                    session.state = SessionState::Failed;
                    session.error = Some(message);
                }
            }
        }

        StatusReport {
            state: session.state,
            new_lines,
            exit_code: session.exit_code,
            error: session.error.clone(),
            session_id: Some(session.id),
            started_at: session.started_at,
        }
    }

    /// Current state of the session slot
    pub fn state(&self) -> SessionState {
        self.lock_session()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// True while a session is starting, running, or stopping
    pub fn is_streaming(&self) -> bool {
        let state = self.state();
        state != SessionState::Idle && !state.is_terminal()
    }

    /// Last `n` lines of the session log (lines already drained by
    /// poll_status), oldest first
    pub fn log_tail(&self, n: usize) -> Vec<String> {
        let slot = self.lock_session();
        match slot.as_ref() {
            Some(session) => {
                let skip = session.log_buffer.len().saturating_sub(n);
                session.log_buffer[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Mark a session that is still Starting as Failed; later states win
    fn fail_starting_session(&self, id: Uuid, message: String) {
        let mut slot = self.lock_session();
        if let Some(session) = slot.as_mut() {
            if session.id == id && session.state == SessionState::Starting {
                log::error!("Session {id}: {message}");
                session.state = SessionState::Failed;
                session.error = Some(message);
            }
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<StreamSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let mut slot = self.lock_session();
        if let Some(session) = slot.as_mut() {
            if !session.state.is_terminal() {
                if let Some(child) = session.child.take() {
                    log::warn!(
                        "Session {}: controller dropped while active, killing encoder",
                        session.id
                    );
                    let mut guard = lock_child(&child);
                    let _ = guard.kill();
                    let _ = guard.wait();
                }
            }
        }
    }
}

fn find_encoder() -> String {
    if let Ok(path) = std::env::var(ENCODER_ENV_VAR) {
        if Path::new(&path).exists() {
            log::info!("Using encoder from {ENCODER_ENV_VAR}: {path}");
            return path;
        }
        log::warn!("{ENCODER_ENV_VAR} points to a missing file: {path}");
    }

    match which::which(DEFAULT_ENCODER_BINARY) {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(_) => DEFAULT_ENCODER_BINARY.to_string(),
    }
}

/// Pre-flight validation: exactly one source, both destination fields, and
/// a local source must exist on disk. Runs before any process activity.
fn validate_config(config: &SessionConfig) -> Result<StreamSource, SessionError> {
    let source_path = config
        .source_path
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let source_url = config
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let source = match (source_path, source_url) {
        (Some(_), Some(_)) => {
            return Err(SessionError::InvalidConfig {
                field: "source",
                reason: "a local file and a remote URL are both set".to_string(),
            });
        }
        (None, None) => {
            return Err(SessionError::InvalidConfig {
                field: "source",
                reason: "either a local file or a remote URL is required".to_string(),
            });
        }
        (Some(path), None) => {
            if !Path::new(path).exists() {
                return Err(SessionError::InvalidConfig {
                    field: "sourcePath",
                    reason: format!("file does not exist: {path}"),
                });
            }
            StreamSource::LocalFile(PathBuf::from(path))
        }
        (None, Some(url)) => StreamSource::RemoteUrl(url.to_string()),
    };

    if config.destination_url.trim().is_empty() {
        return Err(SessionError::InvalidConfig {
            field: "destinationUrl",
            reason: "destination URL is required".to_string(),
        });
    }
    if config.stream_key.trim().is_empty() {
        return Err(SessionError::InvalidConfig {
            field: "streamKey",
            reason: "stream key is required".to_string(),
        });
    }

    Ok(source)
}

/// Deterministic encoder argv. The input loops forever so a short clip keeps
/// the stream alive; output is FLV over RTMP.
fn build_encoder_args(input: &str, publish_url: &str) -> Vec<String> {
    let mut args = Vec::new();
    args.push("-stream_loop".to_string());
    args.push("-1".to_string());
    args.push("-i".to_string());
    args.push(input.to_string());
    args.push("-vcodec".to_string());
    args.push("libx264".to_string());
    args.push("-b:v".to_string());
    args.push("10M".to_string());
    args.push("-acodec".to_string());
    args.push("aac".to_string());
    args.push("-b:a".to_string());
    args.push("128k".to_string());
    args.push("-f".to_string());
    args.push("flv".to_string());
    args.push(publish_url.to_string());
    args
}

/// Redact the stream key in any RTMP(S) URL embedded in a line. The encoder
/// echoes the publish target on startup, so captured output and logged argv
/// both pass through here.
fn redact_line(line: &str) -> String {
    let scheme_pos = match line.find("rtmp://").or_else(|| line.find("rtmps://")) {
        Some(pos) => pos,
        None => return line.to_string(),
    };

    let url_end = line[scheme_pos..]
        .find(|c: char| c == ' ' || c == '\'' || c == '"')
        .map(|i| scheme_pos + i)
        .unwrap_or(line.len());
    let url = &line[scheme_pos..url_end];

    let scheme_end = url.find("://").map(|i| i + 2).unwrap_or(0);
    let redacted = match url.rfind('/') {
        Some(pos) if pos > scheme_end => format!("{}/***", &url[..pos]),
        _ => "***".to_string(),
    };

    format!("{}{redacted}{}", &line[..scheme_pos], &line[url_end..])
}

fn forward_lines<R: Read>(pipe: R, tx: &Sender<MonitorEvent>) {
    let reader = BufReader::new(pipe);
    for line in reader.lines().map_while(Result::ok) {
        if tx.send(MonitorEvent::Line(redact_line(&line))).is_err() {
            break;
        }
    }
}

/// Wait for the exit status without holding the child lock across a sleep.
/// Child caches the status, so the stop path can reap it too.
fn reap_child(child: &Arc<Mutex<Child>>) -> Option<ExitStatus> {
    loop {
        let mut guard = lock_child(child);
        match guard.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                log::warn!("Failed to check encoder exit status: {e}");
                return guard.wait().ok();
            }
        }
        drop(guard);
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn lock_child(child: &Arc<Mutex<Child>>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_both_sources() {
        let config = SessionConfig {
            source_path: Some("/tmp/a.mp4".to_string()),
            source_url: Some("https://site.example/watch".to_string()),
            destination_url: "rtmp://ingest.example/live".to_string(),
            stream_key: "key".to_string(),
        };
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { field: "source", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_no_source() {
        let config = SessionConfig {
            destination_url: "rtmp://ingest.example/live".to_string(),
            stream_key: "key".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { field: "source", .. })
        ));
    }

    #[test]
    fn test_validate_whitespace_source_counts_as_empty() {
        let config = SessionConfig {
            source_url: Some("   ".to_string()),
            destination_url: "rtmp://ingest.example/live".to_string(),
            stream_key: "key".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { field: "source", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_local_file() {
        let config = SessionConfig {
            source_path: Some("/nonexistent/clip.mp4".to_string()),
            destination_url: "rtmp://ingest.example/live".to_string(),
            stream_key: "key".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { field: "sourcePath", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_destination_fields() {
        let config = SessionConfig {
            source_url: Some("https://site.example/watch".to_string()),
            destination_url: "  ".to_string(),
            stream_key: "key".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { field: "destinationUrl", .. })
        ));

        let config = SessionConfig {
            source_url: Some("https://site.example/watch".to_string()),
            destination_url: "rtmp://ingest.example/live".to_string(),
            stream_key: String::new(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(SessionError::InvalidConfig { field: "streamKey", .. })
        ));
    }

    #[test]
    fn test_validate_accepts_remote_url() {
        let config = SessionConfig {
            source_url: Some("https://site.example/watch".to_string()),
            destination_url: "rtmp://ingest.example/live".to_string(),
            stream_key: "key".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(
            validate_config(&config).unwrap(),
            StreamSource::RemoteUrl("https://site.example/watch".to_string())
        );
    }

    #[test]
    fn test_build_encoder_args_shape() {
        let args = build_encoder_args("/tmp/clip.mp4", "rtmps://ingest.example/s/key");
        assert_eq!(
            args,
            vec![
                "-stream_loop",
                "-1",
                "-i",
                "/tmp/clip.mp4",
                "-vcodec",
                "libx264",
                "-b:v",
                "10M",
                "-acodec",
                "aac",
                "-b:a",
                "128k",
                "-f",
                "flv",
                "rtmps://ingest.example/s/key",
            ]
        );
    }

    #[test]
    fn test_redact_line_hides_stream_key() {
        assert_eq!(
            redact_line("rtmps://dc4-1.rtmp.t.me/s/verysecret"),
            "rtmps://dc4-1.rtmp.t.me/s/***"
        );
        assert_eq!(
            redact_line("Output #0, flv, to 'rtmp://ingest.example/live/secret':"),
            "Output #0, flv, to 'rtmp://ingest.example/live/***':"
        );
    }

    #[test]
    fn test_redact_line_leaves_plain_lines_alone() {
        assert_eq!(redact_line("frame= 100 fps= 25"), "frame= 100 fps= 25");
    }
}
