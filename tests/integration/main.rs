//! Integration tests for the Fuzzball agent

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn agent() -> Command {
        let mut cmd = cargo_bin_cmd!("fuzzball-agent");
        cmd.env_remove("FUZZBALL_CONFIG").env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        agent()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Per-node compute agent"));
    }

    #[test]
    fn version_displays() {
        agent()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("fuzzball-agent"));
    }

    #[test]
    fn config_path_default() {
        agent()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("/etc/fuzzball/config.toml"));
    }

    #[test]
    fn config_path_from_env() {
        agent()
            .env("FUZZBALL_CONFIG", "/opt/node/agent.toml")
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("/opt/node/agent.toml"));
    }

    #[test]
    fn config_show_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[node]
id = "edge-4"

[volumes.persistent]
location = "/srv/data"
"#,
        )
        .unwrap();

        agent()
            .args(["config", "show", "--config"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("[nats]"))
            .stdout(predicate::str::contains("edge-4"))
            .stdout(predicate::str::contains("/srv/data"));
    }

    #[test]
    fn config_show_applies_overrides() {
        let dir = TempDir::new().unwrap();

        agent()
            .args(["--node-id", "n9", "--nats-servers", "nats://bus:4222", "config", "show"])
            .arg("--config")
            .arg(dir.path().join("missing.toml"))
            .assert()
            .success()
            .stdout(predicate::str::contains("n9"))
            .stdout(predicate::str::contains("nats://bus:4222"));
    }

    #[test]
    fn invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[node\nid = ").unwrap();

        agent()
            .args(["config", "show", "--config"])
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn run_without_reachable_bus_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[nats]\nservers = [\"nats://127.0.0.1:9\"]\n").unwrap();

        agent()
            .args(["run", "--config"])
            .arg(&path)
            .timeout(std::time::Duration::from_secs(30))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to connect to messaging system"));
    }
}

mod agent_tests {
    use fuzzball_agent::agent::messages::{ImageCached, ImageDownloaded, JobFinished, VolumeResult};
    use fuzzball_agent::bus::{MemoryBus, MessageBus, Subscription};
    use fuzzball_agent::cache::ArtifactKind;
    use fuzzball_agent::config::schema::{CacheConfig, RuntimeConfig, VolumeConfig, VolumeSpec};
    use fuzzball_agent::config::Config;
    use fuzzball_agent::orchestration::JobStatus;
    use fuzzball_agent::{Agent, AgentResult, AgentState};
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use serial_test::serial;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    const NODE: &str = "test-node";
    const WAIT: Duration = Duration::from_secs(10);

    /// Stand-in sandbox runtime: records the call, reports binds and image, runs the command
    const FAKE_RUNTIME: &str = r#"#!/bin/sh
touch "$(dirname "$0")/invoked"
shift
if [ "$1" = "--bind" ]; then
    echo "bind=$2"
    shift 2
fi
echo "image=$1"
shift
exec "$@"
"#;

    struct Harness {
        dir: TempDir,
        bus: Arc<MemoryBus>,
        agent: Arc<Agent>,
        run: JoinHandle<AgentResult<()>>,
    }

    impl Harness {
        async fn start() -> Self {
            Self::with_drain_timeout(30).await
        }

        async fn with_drain_timeout(secs: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let runtime = write_runtime(dir.path());

            let mut volumes = BTreeMap::new();
            volumes.insert(
                "ephemeral".to_string(),
                VolumeSpec {
                    location: dir.path().join("volumes"),
                },
            );
            volumes.insert(
                "persistent".to_string(),
                VolumeSpec {
                    location: dir.path().join("shared"),
                },
            );

            let mut config = Config {
                volumes: VolumeConfig(volumes),
                cache: CacheConfig {
                    dir: dir.path().join("cache"),
                },
                runtime: RuntimeConfig {
                    binary: runtime.display().to_string(),
                },
                ..Config::default()
            };
            config.node.id = NODE.to_string();
            config.nats.drain_timeout_secs = secs;

            let bus = Arc::new(MemoryBus::new());
            let agent = Arc::new(Agent::new(&config, bus.clone()).await.unwrap());
            let mut state = agent.watch_state();
            let runner = agent.clone();
            let run = tokio::spawn(async move { runner.run().await });
            tokio::time::timeout(WAIT, state.wait_for(|s| *s == AgentState::Running))
                .await
                .unwrap()
                .unwrap();

            Self {
                dir,
                bus,
                agent,
                run,
            }
        }

        fn runtime_invoked(&self) -> bool {
            self.dir.path().join("invoked").exists()
        }

        /// Send a command and return its result, checking it was acknowledged first
        async fn request<T: DeserializeOwned>(
            &self,
            command: &str,
            payload: Value,
            result_subject: &str,
        ) -> T {
            let mut result = self.bus.subscribe(result_subject).await.unwrap();
            self.send(command, payload.to_string().into_bytes()).await;
            let message = receive(&mut result).await;
            serde_json::from_slice(&message.payload).unwrap()
        }

        /// Send a raw command and wait for its acknowledgement
        async fn send(&self, command: &str, payload: Vec<u8>) {
            let inbox = format!("_INBOX.{}", next_inbox_id());
            let mut ack = self.bus.subscribe(&inbox).await.unwrap();
            self.bus
                .publish_request(&format!("node.{}.{}", NODE, command), &inbox, payload)
                .unwrap();
            assert!(receive(&mut ack).await.payload.is_empty());
        }

        async fn stop(self) -> TempDir {
            self.agent.stop();
            tokio::time::timeout(WAIT, self.run)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(self.agent.state(), AgentState::Closed);
            self.dir
        }
    }

    fn next_inbox_id() -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NEXT.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn receive(subscription: &mut Subscription) -> fuzzball_agent::bus::Message {
        tokio::time::timeout(WAIT, subscription.next())
            .await
            .unwrap_or_else(|_| panic!("nothing received on {}", subscription.subject()))
            .unwrap()
    }

    fn write_runtime(dir: &Path) -> PathBuf {
        let path = dir.join("singularity");
        std::fs::write(&path, FAKE_RUNTIME).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn job(id: &str, command: &[&str]) -> Value {
        json!({
            "id": id,
            "name": "test",
            "image": "docker://alpine:3.12",
            "command": command,
            "volumes": [],
        })
    }

    async fn collect_output(subscription: &mut Subscription) -> String {
        let mut output = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(200), subscription.next()).await
        {
            output.extend_from_slice(&message.payload);
        }
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn job_exit_zero_completes() {
        let harness = Harness::start().await;
        let mut output = harness.bus.subscribe("job.j0.output").await.unwrap();

        let finished: JobFinished = harness
            .request("job.start", job("j0", &["echo", "hello"]), "job.j0.finished")
            .await;

        assert_eq!(
            finished,
            JobFinished {
                status: JobStatus::Completed,
                rc: 0,
                err: None
            }
        );
        let output = collect_output(&mut output).await;
        assert!(output.contains("image=docker://alpine:3.12"));
        assert!(output.contains("hello"));
        assert!(!output.contains("bind="));

        harness.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn job_exit_seventeen_fails() {
        let harness = Harness::start().await;

        let finished: JobFinished = harness
            .request(
                "job.start",
                job("j17", &["sh", "-c", "exit 17"]),
                "job.j17.finished",
            )
            .await;

        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.rc, 17);
        assert_eq!(finished.err, None);

        harness.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn missing_cached_image_fails_before_spawn() {
        let harness = Harness::start().await;
        let mut payload = job("jc", &["true"]);
        payload["cached"] = json!(true);
        payload["hash"] = json!(format!("sha256.{}", "e".repeat(64)));

        let finished: JobFinished = harness
            .request("job.start", payload, "job.jc.finished")
            .await;

        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.err.unwrap().contains("Cached image not found"));
        assert!(!harness.runtime_invoked());

        harness.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn cached_image_runs_from_cache() {
        let harness = Harness::start().await;
        let hash = format!("sha256.{}", "f".repeat(64));
        let entry = harness.agent.cache().entry(ArtifactKind::Sif, &hash);
        std::fs::write(entry.path(), b"sif").unwrap();
        let mut output = harness.bus.subscribe("job.jh.output").await.unwrap();

        let mut payload = job("jh", &["true"]);
        payload["Cached"] = json!(true);
        payload["Hash"] = json!(hash);
        let finished: JobFinished = harness
            .request("job.start", payload, "job.jh.finished")
            .await;

        assert_eq!(finished.status, JobStatus::Completed);
        let output = collect_output(&mut output).await;
        assert!(output.contains(&format!("image={}", entry.path().display())));

        harness.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn volumes_bind_into_jobs() {
        let harness = Harness::start().await;

        let created: VolumeResult = harness
            .request(
                "volume.create",
                json!({"id": "scratch", "name": "scratch", "type": "EPHEMERAL"}),
                "volume.scratch.create",
            )
            .await;
        assert_eq!(created.err, None);
        let handle = harness.agent.volumes().get_handle("scratch").unwrap();
        assert!(handle.is_dir());

        let mut output = harness.bus.subscribe("job.jv.output").await.unwrap();
        let mut payload = job("jv", &["true"]);
        payload["volumes"] = json!([{"volumeID": "scratch", "location": "/scratch"}]);
        let finished: JobFinished = harness
            .request("job.start", payload, "job.jv.finished")
            .await;

        assert_eq!(finished.status, JobStatus::Completed);
        let output = collect_output(&mut output).await;
        assert!(output.contains(&format!("bind={}:/scratch", handle.display())));

        let deleted: VolumeResult = harness
            .request(
                "volume.delete",
                json!({"id": "scratch", "type": "EPHEMERAL"}),
                "volume.scratch.delete",
            )
            .await;
        assert_eq!(deleted.err, None);
        assert!(!handle.exists());

        harness.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn unknown_volume_fails_job() {
        let harness = Harness::start().await;
        let mut payload = job("ju", &["true"]);
        payload["volumes"] = json!([{"volumeID": "nope", "location": "/data"}]);

        let finished: JobFinished = harness
            .request("job.start", payload, "job.ju.finished")
            .await;

        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.err.unwrap().contains("nope"));
        assert!(!harness.runtime_invoked());

        harness.stop().await;
    }

    #[tokio::test]
    async fn volume_errors_are_reported() {
        let harness = Harness::start().await;
        let req = json!({"id": "v1", "type": "persistent"});

        let first: VolumeResult = harness
            .request("volume.create", req.clone(), "volume.v1.create")
            .await;
        let second: VolumeResult = harness
            .request("volume.create", req, "volume.v1.create")
            .await;
        let unsupported: VolumeResult = harness
            .request(
                "volume.create",
                json!({"id": "v2", "type": "SCRATCH"}),
                "volume.v2.create",
            )
            .await;
        let missing: VolumeResult = harness
            .request("volume.delete", json!({"id": "v3"}), "volume.v3.delete")
            .await;

        assert_eq!(first.err, None);
        assert!(second.err.unwrap().contains("already exists"));
        assert!(unsupported.err.unwrap().contains("Unsupported volume type"));
        assert!(missing.err.unwrap().contains("does not exist"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn image_cache_check() {
        let harness = Harness::start().await;
        let present = format!("sha256.{}", "1".repeat(64));
        let absent = format!("sha256.{}", "2".repeat(64));
        std::fs::write(
            harness.agent.cache().entry(ArtifactKind::Sif, &present).path(),
            b"sif",
        )
        .unwrap();

        let found: ImageCached = harness
            .request("image.cached", json!(present), "image.cached")
            .await;
        let not_found: ImageCached = harness
            .request("image.cached", json!({"hash": absent}), "image.cached")
            .await;

        assert_eq!(
            found,
            ImageCached {
                hash: present,
                exists: true
            }
        );
        assert!(!not_found.exists);

        harness.stop().await;
    }

    #[tokio::test]
    async fn image_download_requires_hash_tag() {
        let harness = Harness::start().await;

        let downloaded: ImageDownloaded = harness
            .request(
                "image.download",
                json!({"uri": "library://alice/default/busybox:latest"}),
                "image.download",
            )
            .await;

        assert_eq!(downloaded.uri, "library://alice/default/busybox:latest");
        assert!(downloaded.err.unwrap().contains("image hash"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn malformed_command_is_acknowledged_and_dropped() {
        let harness = Harness::start().await;

        harness.send("volume.create", b"not json".to_vec()).await;

        // Still serving afterwards
        let created: VolumeResult = harness
            .request(
                "volume.create",
                json!({"id": "after", "type": "EPHEMERAL"}),
                "volume.after.create",
            )
            .await;
        assert_eq!(created.err, None);

        harness.stop().await;
    }

    #[tokio::test]
    async fn stop_purges_volumes() {
        let harness = Harness::start().await;
        for id in ["a", "b"] {
            let created: VolumeResult = harness
                .request(
                    "volume.create",
                    json!({"id": id, "type": "EPHEMERAL"}),
                    &format!("volume.{}.create", id),
                )
                .await;
            assert_eq!(created.err, None);
        }
        let handles: Vec<PathBuf> = ["a", "b"]
            .iter()
            .map(|id| harness.agent.volumes().get_handle(id).unwrap())
            .collect();
        let bus = harness.bus.clone();
        let agent = harness.agent.clone();

        let _dir = harness.stop().await;

        assert!(bus.closed().is_cancelled());
        assert!(agent.volumes().list().is_empty());
        assert!(handles.iter().all(|h| !h.exists()));
    }

    #[tokio::test]
    async fn stop_while_reconnecting_forces_close() {
        let harness = Harness::start().await;
        harness.bus.set_reconnecting(true);
        let bus = harness.bus.clone();

        harness.stop().await;

        assert!(bus.closed().is_cancelled());
    }

    #[tokio::test]
    #[serial]
    async fn stop_waits_for_running_job() {
        let harness = Harness::start().await;
        let mut finished = harness.bus.subscribe("job.slow.finished").await.unwrap();
        harness
            .send(
                "job.start",
                job("slow", &["sh", "-c", "sleep 0.5; exit 3"]).to_string().into_bytes(),
            )
            .await;

        let bus = harness.bus.clone();
        harness.stop().await;

        let result: JobFinished = serde_json::from_slice(&receive(&mut finished).await.payload).unwrap();
        assert_eq!(result.rc, 3);
        assert!(bus.closed().is_cancelled());
    }

    #[tokio::test]
    #[serial]
    async fn stop_kills_job_outliving_drain_timeout() {
        let harness = Harness::with_drain_timeout(1).await;
        let created: VolumeResult = harness
            .request(
                "volume.create",
                json!({"id": "v1", "type": "EPHEMERAL"}),
                "volume.v1.create",
            )
            .await;
        assert_eq!(created.err, None);
        let handle = harness.agent.volumes().get_handle("v1").unwrap();

        let mut finished = harness.bus.subscribe("job.hung.finished").await.unwrap();
        harness
            .send(
                "job.start",
                job("hung", &["sleep", "30"]).to_string().into_bytes(),
            )
            .await;

        let bus = harness.bus.clone();
        harness.stop().await;

        let result: JobFinished = serde_json::from_slice(&receive(&mut finished).await.payload).unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.err.as_deref(), Some("Job cancelled"));
        assert!(bus.closed().is_cancelled());
        assert!(!handle.exists());
    }
}
