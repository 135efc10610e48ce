use crate::features::instance_management::repo::InstanceStore;
use crate::shared::config::TerminalConfig;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{ClawInstance, InstanceStatus};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_INVALID_DATA: u16 = 1007;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_SERVER_ERROR: u16 = 1011;

/// One attached terminal, keyed by connection identity. Lifetime is bound
/// to the connection: created at admission, destroyed exactly once at
/// teardown.
struct TerminalSession {
    process: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    relay: Option<JoinHandle<()>>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Owns every live terminal session and its teardown. The registry is the
/// single shared structure; removing an entry from it is the linearization
/// point for cleanup, so concurrent teardown triggers resolve to exactly
/// one owner.
pub struct TerminalSessionManager {
    store: Arc<dyn InstanceStore>,
    config: TerminalConfig,
    shell_tokens: Vec<String>,
    sessions: Mutex<HashMap<Uuid, TerminalSession>>,
}

#[derive(Debug)]
struct Rejection {
    notice: String,
    close_code: u16,
}

impl TerminalSessionManager {
    pub fn new(store: Arc<dyn InstanceStore>, config: TerminalConfig) -> ControlPlaneResult<Self> {
        let shell_tokens = parse_shell_command(&config.shell)?;
        Ok(Self {
            store,
            config,
            shell_tokens,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Drive one WebSocket connection from admission to teardown. All
    /// outbound frames go through a single writer task so relay output and
    /// system notices never interleave a partial send.
    pub async fn handle_connection(
        self: Arc<Self>,
        socket: WebSocket,
        raw_instance_id: Option<String>,
    ) {
        let (mut sender, mut receiver) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sender.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let instance = match self.authorize(raw_instance_id.as_deref()).await {
            Ok(instance) => instance,
            Err(rejection) => {
                send_notice(&out_tx, &rejection.notice);
                send_close(&out_tx, rejection.close_code);
                return;
            }
        };

        let container_name = format!("{}-{}", self.config.container_prefix, instance.id);
        let mut command = Command::new(&self.config.docker_command);
        command
            .arg("exec")
            .arg("-i")
            .arg(&container_name)
            .args(&self.shell_tokens)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut process = match command.spawn() {
            Ok(process) => process,
            Err(error) => {
                send_notice(&out_tx, &format!("failed to start terminal process: {error}"));
                send_close(&out_tx, CLOSE_SERVER_ERROR);
                return;
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) = (
            process.stdin.take(),
            process.stdout.take(),
            process.stderr.take(),
        ) else {
            let _ = process.kill().await;
            send_notice(&out_tx, "failed to start terminal process: missing stdio");
            send_close(&out_tx, CLOSE_SERVER_ERROR);
            return;
        };

        let stdin = Arc::new(Mutex::new(stdin));
        let connection_id = Uuid::new_v4();

        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                connection_id,
                TerminalSession {
                    process,
                    stdin: stdin.clone(),
                    relay: None,
                    outbound: out_tx.clone(),
                },
            );
        }

        let relay = tokio::spawn(relay_process_output(
            self.clone(),
            connection_id,
            stdout,
            stderr,
            out_tx.clone(),
        ));

        {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&connection_id) {
                Some(session) => session.relay = Some(relay),
                // Torn down between registration and here; the relay has no
                // owner left to abort it later.
                None => relay.abort(),
            }
        }

        info!(instance_id = %instance.id, %connection_id, container = %container_name, "terminal session opened");
        send_notice(&out_tx, &format!("connected: {container_name}"));
        send_notice(&out_tx, "tip: enter command and press Enter");

        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(payload) => {
                    if payload.trim().is_empty() {
                        continue;
                    }
                    let stdin = {
                        let sessions = self.sessions.lock().await;
                        sessions.get(&connection_id).map(|session| session.stdin.clone())
                    };
                    let Some(stdin) = stdin else { break };
                    let mut guard = stdin.lock().await;
                    if let Err(error) = write_and_flush(&mut guard, payload.as_bytes()).await {
                        send_notice(&out_tx, &format!("write failed: {error}"));
                        send_close(&out_tx, CLOSE_SERVER_ERROR);
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.teardown(connection_id).await;
    }

    /// Tear down one session. Idempotent: whoever removes the registry
    /// entry performs the cleanup, later callers observe an absent entry
    /// and return.
    pub async fn teardown(self: &Arc<Self>, connection_id: Uuid) {
        let Some(mut session) = self.sessions.lock().await.remove(&connection_id) else {
            return;
        };

        {
            let mut stdin = session.stdin.lock().await;
            let _ = stdin.write_all(b"exit\n").await;
            let _ = stdin.flush().await;
        }

        if timeout(self.config.process_shutdown_timeout, session.process.wait())
            .await
            .is_err()
        {
            warn!(%connection_id, "terminal process did not exit in time, killing");
            let _ = session.process.kill().await;
        }

        if let Some(relay) = session.relay.take() {
            relay.abort();
        }

        send_close(&session.outbound, CLOSE_NORMAL);
        debug!(%connection_id, "terminal session torn down");
    }

    /// Tear down every remaining session, concurrently.
    pub async fn shutdown(self: &Arc<Self>) {
        let connection_ids: Vec<Uuid> = self.sessions.lock().await.keys().copied().collect();
        if connection_ids.is_empty() {
            return;
        }
        info!(sessions = connection_ids.len(), "tearing down terminal sessions");
        join_all(
            connection_ids
                .into_iter()
                .map(|connection_id| self.teardown(connection_id)),
        )
        .await;
    }

    async fn authorize(&self, raw_instance_id: Option<&str>) -> Result<ClawInstance, Rejection> {
        let instance_id = raw_instance_id
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| Rejection {
                notice: "instanceId is required".to_string(),
                close_code: CLOSE_INVALID_DATA,
            })?;

        let instance = self
            .store
            .find_by_id(instance_id)
            .await
            .map_err(|error: ControlPlaneError| Rejection {
                notice: format!("instance lookup failed: {}", error.detail()),
                close_code: CLOSE_SERVER_ERROR,
            })?
            .ok_or_else(|| Rejection {
                notice: "instance not found".to_string(),
                close_code: CLOSE_INVALID_DATA,
            })?;

        if instance.status != InstanceStatus::Running {
            return Err(Rejection {
                notice: "instance is not running".to_string(),
                close_code: CLOSE_POLICY_VIOLATION,
            });
        }

        Ok(instance)
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// The one background reader per connection: forwards combined stdout and
/// stderr chunks as text frames until both streams end, an I/O error
/// occurs, or the connection goes away.
async fn relay_process_output(
    manager: Arc<TerminalSessionManager>,
    connection_id: Uuid,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    outbound: mpsc::UnboundedSender<Message>,
) {
    let mut stdout_buf = [0u8; 4096];
    let mut stderr_buf = [0u8; 4096];
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let chunk = tokio::select! {
            read = stdout.read(&mut stdout_buf), if stdout_open => match read {
                Ok(0) | Err(_) => {
                    stdout_open = false;
                    continue;
                }
                Ok(n) => String::from_utf8_lossy(&stdout_buf[..n]).into_owned(),
            },
            read = stderr.read(&mut stderr_buf), if stderr_open => match read {
                Ok(0) | Err(_) => {
                    stderr_open = false;
                    continue;
                }
                Ok(n) => String::from_utf8_lossy(&stderr_buf[..n]).into_owned(),
            },
        };

        if chunk.is_empty() {
            continue;
        }
        if outbound.send(Message::Text(chunk)).is_err() {
            break;
        }
    }

    // End of stream is a teardown trigger like any other; run it from a
    // fresh task so aborting this one cannot cancel the cleanup.
    tokio::spawn(async move { manager.teardown(connection_id).await });
}

async fn write_and_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

fn parse_shell_command(raw: &str) -> ControlPlaneResult<Vec<String>> {
    let tokens: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        return Err(ControlPlaneError::InvalidConfig(
            "terminal shell command must not be blank".to_string(),
        ));
    }
    Ok(tokens)
}

fn send_notice(outbound: &mpsc::UnboundedSender<Message>, text: &str) {
    let _ = outbound.send(Message::Text(format!("[system] {text}\n")));
}

fn send_close(outbound: &mpsc::UnboundedSender<Message>, code: u16) {
    let _ = outbound.send(Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    })));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::instance_management::repo::InMemoryInstanceStore;
    use crate::shared::types::{ClawInstance, DesiredState};
    use chrono::Utc;
    use std::time::Duration;

    fn manager_with_store(store: Arc<InMemoryInstanceStore>) -> Arc<TerminalSessionManager> {
        let config = TerminalConfig {
            process_shutdown_timeout: Duration::from_secs(1),
            ..TerminalConfig::default()
        };
        Arc::new(TerminalSessionManager::new(store, config).unwrap())
    }

    fn instance_with_status(status: InstanceStatus) -> ClawInstance {
        ClawInstance::new(
            "demo".to_string(),
            Uuid::new_v4(),
            "registry.local/claw:1".to_string(),
            Some(42617),
            status,
            DesiredState::Running,
            Utc::now(),
        )
    }

    /// Registers a session backed by a real shell so teardown has a live
    /// process to terminate.
    async fn register_shell_session(manager: &Arc<TerminalSessionManager>) -> Uuid {
        let mut process = Command::new("/bin/sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn test shell");
        let stdin = process.stdin.take().expect("test shell stdin");
        let (out_tx, _out_rx) = mpsc::unbounded_channel();

        let connection_id = Uuid::new_v4();
        manager.sessions.lock().await.insert(
            connection_id,
            TerminalSession {
                process,
                stdin: Arc::new(Mutex::new(stdin)),
                relay: Some(tokio::spawn(async {})),
                outbound: out_tx,
            },
        );
        connection_id
    }

    #[test]
    fn test_parse_shell_command() {
        assert_eq!(parse_shell_command("/bin/sh").unwrap(), vec!["/bin/sh"]);
        assert_eq!(
            parse_shell_command("  /bin/bash -l ").unwrap(),
            vec!["/bin/bash", "-l"]
        );
        assert!(matches!(
            parse_shell_command("   "),
            Err(ControlPlaneError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_shell_rejected_at_construction() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let config = TerminalConfig {
            shell: "  ".to_string(),
            ..TerminalConfig::default()
        };
        let result = TerminalSessionManager::new(store, config);
        assert!(matches!(result, Err(ControlPlaneError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_authorize_requires_instance_id() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let manager = manager_with_store(store);

        for raw in [None, Some(""), Some("  "), Some("not-a-uuid")] {
            let rejection = manager.authorize(raw).await.unwrap_err();
            assert_eq!(rejection.close_code, CLOSE_INVALID_DATA);
            assert_eq!(rejection.notice, "instanceId is required");
        }
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_authorize_unknown_instance() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let manager = manager_with_store(store);

        let rejection = manager
            .authorize(Some(&Uuid::new_v4().to_string()))
            .await
            .unwrap_err();
        assert_eq!(rejection.close_code, CLOSE_INVALID_DATA);
        assert_eq!(rejection.notice, "instance not found");
    }

    #[tokio::test]
    async fn test_authorize_rejects_stopped_instance() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let instance = instance_with_status(InstanceStatus::Stopped);
        let instance_id = instance.id;
        store.insert(instance).await.unwrap();
        let manager = manager_with_store(store);

        let rejection = manager
            .authorize(Some(&instance_id.to_string()))
            .await
            .unwrap_err();
        assert_eq!(rejection.close_code, CLOSE_POLICY_VIOLATION);
        assert_eq!(rejection.notice, "instance is not running");
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_authorize_admits_running_instance() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let instance = instance_with_status(InstanceStatus::Running);
        let instance_id = instance.id;
        store.insert(instance).await.unwrap();
        let manager = manager_with_store(store);

        let admitted = manager
            .authorize(Some(&instance_id.to_string()))
            .await
            .unwrap();
        assert_eq!(admitted.id, instance_id);
    }

    #[tokio::test]
    async fn test_teardown_removes_session_and_stops_process() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let manager = manager_with_store(store);
        let connection_id = register_shell_session(&manager).await;
        assert_eq!(manager.session_count().await, 1);

        manager.teardown(connection_id).await;

        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_triggers_clean_up_once() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let manager = manager_with_store(store);
        let connection_id = register_shell_session(&manager).await;

        // Two triggers racing for the same session: exactly one owns the
        // cleanup, the other observes an absent entry and no-ops.
        tokio::join!(manager.teardown(connection_id), manager.teardown(connection_id));

        assert_eq!(manager.session_count().await, 0);

        // A third trigger long after the fact is still a no-op.
        manager.teardown(connection_id).await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_all_sessions() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let manager = manager_with_store(store);
        register_shell_session(&manager).await;
        register_shell_session(&manager).await;
        register_shell_session(&manager).await;
        assert_eq!(manager.session_count().await, 3);

        manager.shutdown().await;

        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_teardown_of_unknown_connection_is_noop() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let manager = manager_with_store(store);
        manager.teardown(Uuid::new_v4()).await;
        assert_eq!(manager.session_count().await, 0);
    }
}
