//! Shared fixtures: fake workers (shell scripts replaying pre-encoded
//! event frames), fake Nix tools, and a recording CI API.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cadenza_agent::api::{BuildEvent, BuildTask, CiApi, PushCache};
use cadenza_agent::error::{AgentError, TaskStatus};
use cadenza_protocol::Event;

/// Write an executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Write `events`, framed, to a file a fake worker can replay with cat.
pub fn write_events_file(dir: &Path, name: &str, events: &[Event]) -> PathBuf {
    let mut bytes = Vec::new();
    for event in events {
        let payload = event.encode();
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
    }
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A worker that replays the given events on stdout, then exits with
/// `exit_code`. The worker is spawned with an empty environment and
/// cwd `/`, so the script uses absolute tool paths and embeds the
/// events-file path directly.
pub fn fake_worker(dir: &Path, events: &[Event], exit_code: i32) -> PathBuf {
    let events_path = write_events_file(dir, "events.bin", events);
    write_script(
        dir,
        "worker",
        &format!("/bin/cat {}\nexit {exit_code}\n", events_path.display()),
    )
}

/// A worker that replays events and then hangs, for kill-path tests.
pub fn hanging_worker(dir: &Path, events: &[Event]) -> PathBuf {
    let events_path = write_events_file(dir, "events.bin", events);
    write_script(
        dir,
        "worker",
        &format!("/bin/cat {}\n/bin/sleep 600\n", events_path.display()),
    )
}

/// Fake `nix` binary: answers `derivation show` with fixed JSON, accepts
/// `copy` except to URIs containing "unreachable".
pub fn fake_nix(dir: &Path, drv_path: &str, outputs: &[(&str, &str)]) -> PathBuf {
    let outputs_json: Vec<String> = outputs
        .iter()
        .map(|(name, path)| format!(r#""{name}": {{ "path": "{path}" }}"#))
        .collect();
    let json = format!(
        r#"{{ "{drv_path}": {{ "outputs": {{ {} }} }} }}"#,
        outputs_json.join(", ")
    );
    write_script(
        dir,
        "nix",
        &format!(
            r#"case "$*" in
  *"derivation show"*) /bin/cat <<'EOF'
{json}
EOF
;;
  *unreachable*) exit 1 ;;
  *copy*) exit 0 ;;
  *) exit 1 ;;
esac
"#
        ),
    )
}

/// Fake `nix-store` binary answering `--query --size` and `--query --hash`.
pub fn fake_nix_store(dir: &Path, size: u64, hash: &str) -> PathBuf {
    write_script(
        dir,
        "nix-store",
        &format!(
            r#"case "$*" in
  *--size*) echo "  {size}  " ;;
  *--hash*) echo "{hash}" ;;
  *) exit 1 ;;
esac
"#
        ),
    )
}

/// Recording CI API fake. Calls always succeed; transient-failure
/// behaviour is covered by the retry-module tests.
#[derive(Default)]
pub struct MockApi {
    pub events: Mutex<Vec<BuildEvent>>,
    pub statuses: Mutex<Vec<TaskStatus>>,
    pub log: Mutex<Vec<u8>>,
    pub caches: Vec<PushCache>,
}

impl MockApi {
    pub fn with_caches(caches: Vec<PushCache>) -> Self {
        Self {
            caches,
            ..Default::default()
        }
    }

    pub fn recorded_events(&self) -> Vec<BuildEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl CiApi for MockApi {
    async fn poll_build_task(&self) -> Result<Option<BuildTask>, AgentError> {
        Ok(None)
    }

    async fn update_build(&self, _task_id: &str, events: &[BuildEvent]) -> Result<(), AgentError> {
        self.events.lock().unwrap().extend(events.iter().cloned());
        Ok(())
    }

    async fn write_log(&self, _task_id: &str, _token: &str, bytes: &[u8]) -> Result<(), AgentError> {
        self.log.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    async fn get_active_push_caches(&self) -> Result<Vec<PushCache>, AgentError> {
        Ok(self.caches.clone())
    }

    async fn report_task_status(
        &self,
        _task_id: &str,
        status: &TaskStatus,
    ) -> Result<(), AgentError> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

pub fn sample_task(drv_path: &str) -> BuildTask {
    BuildTask {
        id: "task-1".into(),
        drv_path: drv_path.into(),
        input_paths: vec!["/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep".into()],
        log_token: "log-token".into(),
        log_host: "logs.example.com".into(),
    }
}
