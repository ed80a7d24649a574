//! Deployment worker.
//!
//! Consumes deployment jobs from the deployments stream one at a time,
//! materialises an inventory and decrypted SSH keys into private scratch
//! files, supervises an `ansible-playbook` run, and reconciles per-host
//! results back into the database.
//!
//! Unlike the digest worker, every message is ACKed regardless of outcome:
//! the durable record of a failed deployment is the `deployments` row
//! itself, and a bad payload must not retry forever.

pub mod inventory;

use std::io::Write as _;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, StreamMessage, DEPLOYMENTS_STREAM};
use crate::crypto::CryptoError;
use crate::storage::{deployments, servers, StorageError};
use crate::utils::retry::{with_exponential_backoff, RetryConfig};
use inventory::{build_inventory, classify_recap, extra_var_args, parse_run_summary};

/// Consumer group for deployment workers.
pub const CONSUMER_GROUP: &str = "armada-deployers";

/// One deployment at a time per worker.
const BATCH_SIZE: usize = 1;

/// Global deadline for one playbook run.
const RUN_DEADLINE: Duration = Duration::from_secs(600);

/// Liveness log interval.
const HEARTBEAT: Duration = Duration::from_secs(30);

/// Where operator playbooks are mounted.
const PLAYBOOK_ROOT: &str = "/app/ansible/playbooks";

/// Deployment worker failures.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid deployment message: {0}")]
    Payload(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deployment run exceeded its deadline")]
    Timeout,

    #[error("deployment cancelled by shutdown")]
    Cancelled,
}

/// Parsed deployment stream message.
#[derive(Debug)]
struct DeploymentJob {
    deployment_id: Uuid,
    playbook: String,
    server_ids: Vec<Uuid>,
    variables: Value,
}

fn parse_job(message: &StreamMessage) -> Result<DeploymentJob, DeployError> {
    let deployment_id = message
        .field("deployment_id")
        .ok_or_else(|| DeployError::Payload("missing deployment_id".to_string()))?;
    let deployment_id = Uuid::parse_str(deployment_id)
        .map_err(|e| DeployError::Payload(format!("deployment_id: {e}")))?;

    let playbook = message
        .field("playbook")
        .ok_or_else(|| DeployError::Payload("missing playbook".to_string()))?
        .to_string();

    let server_ids_json = message
        .field("server_ids")
        .ok_or_else(|| DeployError::Payload("missing server_ids".to_string()))?;
    let server_ids: Vec<Uuid> = serde_json::from_str(server_ids_json)
        .map_err(|e| DeployError::Payload(format!("server_ids: {e}")))?;

    let variables = match message.field("variables") {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
            .map_err(|e| DeployError::Payload(format!("variables: {e}")))?,
        _ => Value::Object(serde_json::Map::new()),
    };

    Ok(DeploymentJob {
        deployment_id,
        playbook,
        server_ids,
        variables,
    })
}

/// The deployment worker loop.
pub struct DeployWorker {
    pool: PgPool,
    broker: Broker,
    master_key: String,
    consumer: String,
}

impl DeployWorker {
    pub fn new(pool: PgPool, broker: Broker, master_key: String, consumer: String) -> Self {
        Self {
            pool,
            broker,
            master_key,
            consumer,
        }
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        // "$" so a fresh group only sees jobs submitted from now on.
        let created = with_exponential_backoff(
            &token,
            &RetryConfig::default(),
            "create deployer consumer group",
            || self.broker.xgroup_create(DEPLOYMENTS_STREAM, CONSUMER_GROUP, "$"),
        )
        .await;
        if let Err(e) = created {
            error!(error = %e, "could not create consumer group, exiting");
            return;
        }

        info!(consumer = %self.consumer, stream = DEPLOYMENTS_STREAM, "deployment worker ready");

        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = heartbeat.tick() => {
                    info!("deployment worker alive, polling stream");
                }
                result = self.cycle(&token) => {
                    if let Err(e) = result {
                        error!(error = %e, "deployment cycle failed");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }

        info!("deployment worker stopped");
    }

    /// One cycle: drain this consumer's pending job, else take a new one.
    async fn cycle(&self, token: &CancellationToken) -> Result<(), DeployError> {
        let mut messages = self
            .broker
            .xread_group(CONSUMER_GROUP, &self.consumer, DEPLOYMENTS_STREAM, "0", BATCH_SIZE)
            .await?;
        if messages.len() < BATCH_SIZE {
            let new = self
                .broker
                .xread_group(
                    CONSUMER_GROUP,
                    &self.consumer,
                    DEPLOYMENTS_STREAM,
                    ">",
                    BATCH_SIZE - messages.len(),
                )
                .await?;
            messages.extend(new);
        }

        if messages.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        for message in &messages {
            if let Err(e) = self.handle_deployment(token, message).await {
                // The deployments row already records the failure; the
                // stream entry must not retry forever.
                error!(message_id = %message.id, error = %e, "deployment failed");
            }

            if let Err(e) = self
                .broker
                .xack(DEPLOYMENTS_STREAM, CONSUMER_GROUP, std::slice::from_ref(&message.id))
                .await
            {
                warn!(message_id = %message.id, error = %e, "failed to ACK deployment message");
            }
        }

        Ok(())
    }

    async fn handle_deployment(
        &self,
        token: &CancellationToken,
        message: &StreamMessage,
    ) -> Result<(), DeployError> {
        let job = parse_job(message)?;
        info!(
            deployment_id = %job.deployment_id,
            playbook = %job.playbook,
            targets = job.server_ids.len(),
            "processing deployment"
        );

        deployments::mark_running(&self.pool, job.deployment_id, job.server_ids.len() as i64)
            .await?;

        if let Err(e) =
            deployments::insert_deployment_servers(&self.pool, job.deployment_id, &job.server_ids)
                .await
        {
            warn!(error = %e, "failed to create deployment_servers rows");
        }

        let run = tokio::select! {
            _ = token.cancelled() => Err(DeployError::Cancelled),
            result = tokio::time::timeout(RUN_DEADLINE, self.run_playbook(&job)) => {
                result.map_err(|_| DeployError::Timeout).and_then(|r| r)
            }
        };

        match run {
            Ok(outcome) => {
                if !outcome.stdout.is_empty() {
                    self.reconcile_results(&job, &outcome).await;
                }

                let status = if outcome.success { "completed" } else { "failed" };
                deployments::finish(
                    &self.pool,
                    job.deployment_id,
                    status,
                    &outcome.stdout,
                    &outcome.stderr,
                )
                .await?;
                info!(deployment_id = %job.deployment_id, status, "deployment finished");
                Ok(())
            }
            Err(e) => {
                deployments::finish(
                    &self.pool,
                    job.deployment_id,
                    "failed",
                    "",
                    &e.to_string(),
                )
                .await?;
                Err(e)
            }
        }
    }

    /// Spawn and supervise one playbook run. Scratch files are dropped (and
    /// unlinked) when this returns, success or failure.
    async fn run_playbook(&self, job: &DeploymentJob) -> Result<RunOutcome, DeployError> {
        let targets = servers::fetch_deploy_targets(&self.pool, &job.server_ids).await?;
        info!(fetched = targets.len(), "resolved deployment targets");

        let inv = build_inventory(&targets, &self.master_key)?;

        let mut inventory_file = tempfile::NamedTempFile::new()?;
        inventory_file.write_all(inv.yaml.as_bytes())?;
        inventory_file.flush()?;

        let playbook_path = format!("{PLAYBOOK_ROOT}/{}", job.playbook);

        let mut command = tokio::process::Command::new("ansible-playbook");
        command
            .arg("-i")
            .arg(inventory_file.path())
            .arg(&playbook_path)
            // No operator SSH config; host keys are managed per-run.
            .arg("--ssh-common-args")
            .arg("-F /dev/null -o StrictHostKeyChecking=no")
            .args(extra_var_args(&job.variables))
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(playbook = %playbook_path, "running ansible-playbook");
        let started = std::time::Instant::now();
        let output = command.output().await?;
        info!(elapsed = ?started.elapsed(), code = ?output.status.code(), "playbook run finished");

        Ok(RunOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            hostname_to_server: inv.hostname_to_server.clone(),
        })
    }

    /// Map the tool's per-host stats back onto child rows, then recompute
    /// the aggregates. Parse failures only log: the run outcome and raw
    /// output are already durable on the parent row.
    async fn reconcile_results(&self, job: &DeploymentJob, outcome: &RunOutcome) {
        let summary = match parse_run_summary(&outcome.stdout) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(deployment_id = %job.deployment_id, error = %e, "could not parse tool summary");
                return;
            }
        };

        for (hostname, recap) in &summary.stats {
            let Some(server_id) = outcome.hostname_to_server.get(hostname) else {
                warn!(hostname = %hostname, "hostname missing from inventory mapping");
                continue;
            };

            let (status, changed) = classify_recap(recap);
            if let Err(e) = deployments::update_server_result(
                &self.pool,
                job.deployment_id,
                *server_id,
                status,
                changed,
            )
            .await
            {
                error!(hostname = %hostname, error = %e, "failed to update per-host result");
            }
        }

        if let Err(e) = deployments::recompute_aggregates(&self.pool, job.deployment_id).await {
            warn!(deployment_id = %job.deployment_id, error = %e, "failed to recompute aggregates");
        }
    }
}

/// Captured result of one playbook run.
struct RunOutcome {
    success: bool,
    stdout: String,
    stderr: String,
    hostname_to_server: std::collections::HashMap<String, Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(fields: &[(&str, &str)]) -> StreamMessage {
        StreamMessage {
            id: "1-0".to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn parses_a_complete_job() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ids = format!(r#"["{a}","{b}"]"#);
        let deployment = Uuid::new_v4();

        let job = parse_job(&message(&[
            ("deployment_id", &deployment.to_string()),
            ("playbook", "armada/deploy-agent.yml"),
            ("server_ids", &ids),
            ("variables", r#"{"version":"1.2.3"}"#),
            ("timestamp", "2025-01-01T00:00:00Z"),
        ]))
        .unwrap();

        assert_eq!(job.deployment_id, deployment);
        assert_eq!(job.playbook, "armada/deploy-agent.yml");
        assert_eq!(job.server_ids, vec![a, b]);
        assert_eq!(job.variables["version"], "1.2.3");
    }

    #[test]
    fn missing_variables_default_to_empty_object() {
        let job = parse_job(&message(&[
            ("deployment_id", &Uuid::new_v4().to_string()),
            ("playbook", "p.yml"),
            ("server_ids", "[]"),
        ]))
        .unwrap();

        assert!(job.variables.as_object().unwrap().is_empty());
    }

    #[test]
    fn malformed_fields_are_payload_errors() {
        assert!(matches!(
            parse_job(&message(&[("playbook", "p.yml")])),
            Err(DeployError::Payload(_))
        ));
        assert!(matches!(
            parse_job(&message(&[
                ("deployment_id", "not-a-uuid"),
                ("playbook", "p.yml"),
                ("server_ids", "[]"),
            ])),
            Err(DeployError::Payload(_))
        ));
        assert!(matches!(
            parse_job(&message(&[
                ("deployment_id", &Uuid::new_v4().to_string()),
                ("playbook", "p.yml"),
                ("server_ids", "not json"),
            ])),
            Err(DeployError::Payload(_))
        ));
    }
}
