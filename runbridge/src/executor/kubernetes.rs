//! Executor running commands as Kubernetes jobs through `kubectl`
//!
//! Every execution becomes one `batch/v1` Job whose pod runs the staged
//! wrapper script from a shared volume, so the same log-directory
//! bookkeeping applies as everywhere else. The job name is derived from
//! the execution id, which is what makes `kubectl apply` idempotent.

use super::wrapper::{env_file_content, wrapper_script};
use super::{
    collect_result, read_exit_code, ExecutionPaths, ExecutionSettings, Executor, ExecutorError,
    ExecutorResult, KillSignal, ShellCommand, ShellRunner,
};
use crate::common::ids::{ExecutionId, ProcessId};
use crate::execution::{
    ExecutionResult, ExecutionState, ExecutionStateName, ForeignState, ProcessIdOrUnknown,
    SimpleStateMapper, StateCode,
};
use crate::storage::StorageAccessor;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Label carrying the execution id on jobs and pods
const EXECUTION_LABEL: &str = "runbridge.io/execution-id";

/// Polling interval for `wait`
const STATUS_POLL: Duration = Duration::from_secs(5);

/// Kubernetes pod phases, extended with the deletion-in-progress state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum K8sPodPhase {
    /// Pod accepted, containers not all started
    Pending,
    /// At least one container running
    Running,
    /// Pod has a deletion timestamp but is still running
    Terminating,
    /// All containers ended with exit code zero
    Succeeded,
    /// At least one container ended unsuccessfully
    Failed,
    /// The node hosting the pod cannot be reached
    Unknown,
    /// Nothing could be determined
    NotAvailable,
}

impl fmt::Display for K8sPodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl StateCode for K8sPodPhase {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("Pending") => K8sPodPhase::Pending,
            Some("Running") => K8sPodPhase::Running,
            Some("Terminating") => K8sPodPhase::Terminating,
            Some("Succeeded") => K8sPodPhase::Succeeded,
            Some("Failed") => K8sPodPhase::Failed,
            Some("Unknown") => K8sPodPhase::Unknown,
            _ => K8sPodPhase::NotAvailable,
        }
    }

    fn not_available() -> Self {
        K8sPodPhase::NotAvailable
    }

    fn is_terminal_code(&self) -> bool {
        matches!(self, K8sPodPhase::Succeeded | K8sPodPhase::Failed)
    }

    fn is_unknown_code(&self) -> bool {
        matches!(self, K8sPodPhase::Unknown | K8sPodPhase::NotAvailable)
    }

    fn is_success_code(&self) -> bool {
        matches!(self, K8sPodPhase::Succeeded)
    }
}

/// Mapping of pod phases onto the generalized state machine.
///
/// A terminating pod is still running until its containers actually end,
/// so `Terminating` maps to `Running` rather than any terminal state.
pub fn k8s_state_mapper() -> SimpleStateMapper<K8sPodPhase> {
    use ExecutionStateName::*;
    SimpleStateMapper::new(HashMap::from([
        (K8sPodPhase::Pending, Pending),
        (K8sPodPhase::Running, Running),
        (K8sPodPhase::Terminating, Running),
        (K8sPodPhase::Succeeded, Succeeded),
        (K8sPodPhase::Failed, Failed),
    ]))
}

/// Cluster-side configuration for the Kubernetes executor
#[derive(Debug, Clone)]
pub struct K8sSettings {
    /// Namespace jobs are created in
    pub namespace: String,
    /// Container image running the wrapper
    pub image: String,
    /// Persistent volume claim mounted into the pod, with its mount path.
    /// Must be the volume the storage accessor writes wrapper scripts to.
    pub data_claim: String,
    /// Where the claim is mounted inside the container
    pub data_mount_path: String,
}

/// Derive the DNS-safe job name for one execution
fn job_name(execution_id: &ExecutionId) -> String {
    format!("runbridge-{}", execution_id.to_string().to_lowercase())
}

/// Extract phase, pod name, and container exit code from `kubectl get pods
/// -o json` output. A pod with a deletion timestamp still in phase Running
/// counts as Terminating.
fn parse_pod_list(raw: &str) -> ExecutorResult<Option<(String, K8sPodPhase, Option<i32>)>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ExecutorError::Protocol {
            reason: format!("unparseable kubectl output: {}", e),
        })?;
    let items = value["items"].as_array().ok_or_else(|| ExecutorError::Protocol {
        reason: "kubectl output has no items array".to_string(),
    })?;
    if items.is_empty() {
        return Ok(None);
    }
    if items.len() > 1 {
        return Err(ExecutorError::Protocol {
            reason: format!("expected one pod, got {}", items.len()),
        });
    }
    let pod = &items[0];
    let name = pod["metadata"]["name"]
        .as_str()
        .unwrap_or("unnamed")
        .to_string();
    let raw_phase = pod["status"]["phase"].as_str();
    let mut phase = K8sPodPhase::parse(raw_phase);
    if phase == K8sPodPhase::Running && !pod["metadata"]["deletionTimestamp"].is_null() {
        phase = K8sPodPhase::Terminating;
    }
    let exit_code = pod["status"]["containerStatuses"]
        .as_array()
        .and_then(|statuses| statuses.first())
        .and_then(|status| status["state"]["terminated"]["exitCode"].as_i64())
        .map(|code| code as i32);
    Ok(Some((name, phase, exit_code)))
}

/// Executor submitting jobs to a Kubernetes cluster
pub struct KubernetesExecutor {
    settings: K8sSettings,
    runner: Arc<dyn ShellRunner>,
    storage: Arc<dyn StorageAccessor>,
    mapper: SimpleStateMapper<K8sPodPhase>,
}

impl KubernetesExecutor {
    /// Create an executor talking to the cluster `runner`'s kubectl
    /// context points at. `storage` must address the filesystem behind
    /// `settings.data_claim`.
    pub fn new(
        settings: K8sSettings,
        runner: Arc<dyn ShellRunner>,
        storage: Arc<dyn StorageAccessor>,
    ) -> Self {
        Self {
            settings,
            runner,
            storage,
            mapper: k8s_state_mapper(),
        }
    }

    fn kubectl(&self) -> ShellCommand {
        ShellCommand::new("kubectl")
            .arg("--namespace")
            .arg(&self.settings.namespace)
    }

    /// Render the `batch/v1` Job manifest for one execution
    fn job_manifest(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> serde_json::Value {
        let mut resources = serde_json::Map::new();
        if let Some(milli) = settings.milli_cpus {
            resources.insert("cpu".to_string(), json!(format!("{}m", milli)));
        }
        if let Some(memory_kib) = settings.memory_kib {
            resources.insert("memory".to_string(), json!(format!("{}Ki", memory_kib)));
        }
        let mut spec = json!({
            "backoffLimit": 0,
            "template": {
                "metadata": {
                    "labels": { EXECUTION_LABEL: execution_id.to_string() }
                },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "command",
                        "image": self.settings.image,
                        "command": ["/bin/sh", paths.wrapper_file().to_string_lossy()],
                        "volumeMounts": [{
                            "name": "data",
                            "mountPath": self.settings.data_mount_path,
                        }],
                        "resources": { "requests": resources.clone(), "limits": resources }
                    }],
                    "volumes": [{
                        "name": "data",
                        "persistentVolumeClaim": { "claimName": self.settings.data_claim }
                    }]
                }
            }
        });
        if let Some(seconds) = settings.walltime.map(|w| w.as_secs()) {
            spec["activeDeadlineSeconds"] = json!(seconds);
        }
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name(execution_id),
                "labels": { EXECUTION_LABEL: execution_id.to_string() }
            },
            "spec": spec
        })
    }

    async fn observe(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ForeignState<K8sPodPhase>> {
        let command = self
            .kubectl()
            .arg("get")
            .arg("pods")
            .arg("--selector")
            .arg(format!("{}={}", EXECUTION_LABEL, execution_id))
            .arg("--output")
            .arg("json");
        let output = self.runner.run(&command).await?;
        let fallback_pid = ProcessId::new(job_name(execution_id), self.hostname());
        if !output.succeeded() {
            return Ok(ForeignState::unknown(
                K8sPodPhase::not_available(),
                fallback_pid,
                Utc::now(),
                vec![format!("kubectl get pods failed: {}", output.stderr.trim())],
            ));
        }
        match parse_pod_list(&output.stdout)? {
            Some((pod_name, phase, exit_code)) => {
                let pid = ProcessId::new(pod_name, self.hostname());
                // The container exit code and the wrapper's exit file agree
                // by construction; prefer the container's report.
                let exit_code = match exit_code {
                    Some(code) => Some(code),
                    None if phase.is_terminal_code() => {
                        read_exit_code(self.storage.as_ref(), paths).await?
                    }
                    None => None,
                };
                Ok(phase.into_foreign_state(pid, exit_code, Utc::now(), vec![]))
            }
            None => {
                // No pod yet (job accepted, pod unscheduled) or pod already
                // garbage-collected; the exit file disambiguates.
                match read_exit_code(self.storage.as_ref(), paths).await? {
                    Some(exit_code) => {
                        let phase = if exit_code == 0 {
                            K8sPodPhase::Succeeded
                        } else {
                            K8sPodPhase::Failed
                        };
                        Ok(phase.into_foreign_state(
                            fallback_pid,
                            Some(exit_code),
                            Utc::now(),
                            vec![],
                        ))
                    }
                    None => Ok(ForeignState::unknown(
                        K8sPodPhase::not_available(),
                        fallback_pid,
                        Utc::now(),
                        vec![format!("no pod for execution {}", execution_id)],
                    )),
                }
            }
        }
    }

    async fn job_exists(&self, execution_id: &ExecutionId) -> ExecutorResult<bool> {
        let command = self
            .kubectl()
            .arg("get")
            .arg("job")
            .arg(job_name(execution_id))
            .arg("--ignore-not-found")
            .arg("--output")
            .arg("name");
        let output = self.runner.run(&command).await?;
        if !output.succeeded() {
            return Err(ExecutorError::CommandFailed {
                command: command.to_command_line(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(!output.stdout.trim().is_empty())
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    type Code = K8sPodPhase;

    fn hostname(&self) -> String {
        format!("k8s:{}", self.settings.namespace)
    }

    fn storage(&self) -> Arc<dyn StorageAccessor> {
        self.storage.clone()
    }

    fn mapper(&self) -> &SimpleStateMapper<K8sPodPhase> {
        &self.mapper
    }

    async fn execute(
        &self,
        execution_id: &ExecutionId,
        command: &ShellCommand,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> ExecutorResult<ExecutionState<K8sPodPhase>> {
        if !self.storage.exists(&paths.workdir).await? {
            return Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::Failed,
                ProcessIdOrUnknown::Unknown,
                Some(1),
                format!("working directory {} does not exist", paths.workdir.display()),
            ));
        }
        self.storage.create_dir(&paths.log_dir).await?;

        // The job name is a pure function of the execution id, so an
        // already existing job means this submission was already made.
        if self.job_exists(execution_id).await? {
            tracing::info!(
                execution_id = %execution_id,
                job = %job_name(execution_id),
                "recovering previously submitted kubernetes job"
            );
            let observed = self.observe(execution_id, paths).await?;
            let state = ExecutionState::start(*execution_id);
            return Ok(self.mapper.transition(state, observed)?);
        }

        self.storage
            .put_bytes(
                env_file_content(execution_id, command).as_bytes(),
                &paths.env_file(),
            )
            .await?;
        let with_stdin = self.storage.exists(&paths.stdin_file()).await?;
        self.storage
            .put_bytes(
                wrapper_script(command, paths, with_stdin).as_bytes(),
                &paths.wrapper_file(),
            )
            .await?;

        let manifest = self.job_manifest(execution_id, paths, settings);
        let apply = self.kubectl().arg("apply").arg("-f").arg("-");
        let output = self
            .runner
            .run_with_stdin(&apply, &manifest.to_string())
            .await?;
        if !output.succeeded() {
            return Ok(ExecutionState::synthetic_failure(
                *execution_id,
                ExecutionStateName::SystemError,
                ProcessIdOrUnknown::Unknown,
                None,
                format!("kubectl apply failed: {}", output.stderr.trim()),
            ));
        }
        tracing::info!(
            execution_id = %execution_id,
            job = %job_name(execution_id),
            namespace = %self.settings.namespace,
            "submitted kubernetes job"
        );

        let accepted = ForeignState::known(
            K8sPodPhase::Pending,
            ProcessId::new(job_name(execution_id), self.hostname()),
            Utc::now(),
            vec![],
        );
        let state = ExecutionState::start(*execution_id);
        Ok(self.mapper.transition(state, accepted)?)
    }

    async fn get_status(
        &self,
        execution_id: &ExecutionId,
        paths: &ExecutionPaths,
        _pid: Option<&ProcessId>,
    ) -> ExecutorResult<Option<ForeignState<K8sPodPhase>>> {
        Ok(Some(self.observe(execution_id, paths).await?))
    }

    async fn get_result(
        &self,
        state: &ExecutionState<K8sPodPhase>,
        command: &ShellCommand,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<ExecutionResult> {
        collect_result(self.storage.as_ref(), state, command, paths).await
    }

    async fn kill(
        &self,
        state: &ExecutionState<K8sPodPhase>,
        _signal: KillSignal,
    ) -> ExecutorResult<bool> {
        if state.is_terminal() {
            return Ok(true);
        }
        // Kubernetes has no per-signal delivery; deleting the job sends
        // TERM and, after the grace period, KILL.
        let command = self
            .kubectl()
            .arg("delete")
            .arg("job")
            .arg(job_name(&state.execution_id()))
            .arg("--wait=false");
        let output = self.runner.run(&command).await?;
        if output.succeeded() {
            return Ok(true);
        }
        Ok(output.stderr.contains("NotFound") || output.stderr.contains("not found"))
    }

    async fn wait(
        &self,
        state: &ExecutionState<K8sPodPhase>,
        paths: &ExecutionPaths,
    ) -> ExecutorResult<()> {
        if state.is_terminal() {
            return Ok(());
        }
        let execution_id = state.execution_id();
        loop {
            if read_exit_code(self.storage.as_ref(), paths).await?.is_some() {
                return Ok(());
            }
            let observed = self.observe(&execution_id, paths).await?;
            if observed.is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }
}
