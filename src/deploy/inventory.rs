//! Inventory materialisation and tool-output parsing.
//!
//! The inventory is a YAML document naming every target host with its SSH
//! reachability; hosts with a bound primary key additionally point at a
//! freshly written 0600 temp key file. Key files and the inventory live
//! only as long as the [`Inventory`] value: dropping it unlinks everything,
//! on every exit path.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;

use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;
use uuid::Uuid;

use super::DeployError;
use crate::crypto;
use crate::storage::servers::DeployTarget;

/// Materialised inventory plus the scratch files backing it.
pub struct Inventory {
    pub yaml: String,
    /// Hostname as it appears in the inventory → host id, for mapping the
    /// tool's per-host stats back onto `deployment_servers` rows.
    pub hostname_to_server: HashMap<String, Uuid>,
    key_files: Vec<NamedTempFile>,
}

impl Inventory {
    pub fn key_file_count(&self) -> usize {
        self.key_files.len()
    }
}

/// Build the YAML inventory, decrypting each bound key into a temp file.
///
/// A host whose key fails to decrypt still appears in the inventory — the
/// tool will report it unreachable rather than the whole run aborting.
pub fn build_inventory(
    targets: &[DeployTarget],
    master_key: &str,
) -> Result<Inventory, DeployError> {
    let mut yaml = String::from("all:\n  hosts:\n");
    let mut hostname_to_server = HashMap::new();
    let mut key_files = Vec::new();

    for target in targets {
        let _ = writeln!(yaml, "    {}:", target.hostname);
        let _ = writeln!(yaml, "      ansible_host: {}", target.ssh_host);
        let _ = writeln!(yaml, "      ansible_port: {}", target.ssh_port);
        let _ = writeln!(yaml, "      ansible_user: {}", target.ssh_username);
        let _ = writeln!(yaml, "      agent_server_id: {}", target.agent_server_id);

        hostname_to_server.insert(target.hostname.clone(), target.id);

        if let Some(encrypted) = &target.encrypted_key {
            let key_pem = match crypto::decrypt_auto(encrypted, master_key) {
                Ok(pem) => pem,
                Err(e) => {
                    warn!(hostname = %target.hostname, error = %e, "failed to decrypt SSH key, host will run without one");
                    continue;
                }
            };

            let key_file = write_key_file(&key_pem)?;
            let _ = writeln!(
                yaml,
                "      ansible_ssh_private_key_file: {}",
                key_file.path().display()
            );
            key_files.push(key_file);
        }
    }

    Ok(Inventory {
        yaml,
        hostname_to_server,
        key_files,
    })
}

/// Write one decrypted key to a 0600 temp file.
fn write_key_file(key_pem: &str) -> Result<NamedTempFile, DeployError> {
    let mut file = NamedTempFile::new()?;
    file.write_all(key_pem.as_bytes())?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(file)
}

/// Per-host stats block from the tool's JSON summary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayRecap {
    pub ok: i64,
    pub changed: i64,
    pub unreachable: i64,
    pub failures: i64,
    pub skipped: i64,
    pub rescued: i64,
    pub ignored: i64,
}

/// The tool's JSON summary; only `stats` matters here.
#[derive(Debug, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub stats: HashMap<String, PlayRecap>,
}

/// Parse the captured stdout as a run summary.
pub fn parse_run_summary(stdout: &str) -> Result<RunSummary, DeployError> {
    serde_json::from_str(stdout).map_err(|e| DeployError::Payload(format!("tool summary: {e}")))
}

/// Classify one host's recap into a `deployment_servers` status plus the
/// `changed` flag.
pub fn classify_recap(recap: &PlayRecap) -> (&'static str, bool) {
    use crate::storage::deployments::{HOST_STATUS_FAILED, HOST_STATUS_SKIPPED, HOST_STATUS_SUCCESS};

    let status = if recap.unreachable > 0 || recap.failures > 0 {
        HOST_STATUS_FAILED
    } else if recap.skipped > 0 && recap.ok == 0 {
        HOST_STATUS_SKIPPED
    } else {
        HOST_STATUS_SUCCESS
    };

    (status, recap.changed > 0)
}

/// Render a `variables` JSON object into `-e key=value` argument pairs.
///
/// String values pass through unquoted; everything else renders as JSON.
pub fn extra_var_args(variables: &Value) -> Vec<String> {
    let Value::Object(map) = variables else {
        return Vec::new();
    };

    let mut args = Vec::with_capacity(map.len() * 2);
    for (key, value) in map {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        args.push("-e".to_string());
        args.push(format!("{key}={rendered}"));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(hostname: &str, key: Option<&str>) -> DeployTarget {
        DeployTarget {
            id: Uuid::new_v4(),
            hostname: hostname.to_string(),
            ssh_host: format!("{hostname}.internal"),
            ssh_port: 22,
            ssh_username: "deploy".to_string(),
            encrypted_key: key.map(String::from),
            agent_server_id: Uuid::new_v4().to_string(),
        }
    }

    #[test]
    fn inventory_includes_key_file_only_when_bound() {
        let master = "inventory-master-key";
        let encrypted = crypto::encrypt("-----BEGIN KEY-----\nk\n-----END KEY-----", master).unwrap();

        let targets = vec![target("web-1", Some(&encrypted)), target("web-2", None)];
        let inventory = build_inventory(&targets, master).unwrap();

        assert!(inventory.yaml.contains("web-1:"));
        assert!(inventory.yaml.contains("web-2:"));
        assert!(inventory.yaml.contains("ansible_host: web-1.internal"));
        assert_eq!(inventory.key_file_count(), 1);

        // Exactly one host carries a key file line.
        let key_lines = inventory
            .yaml
            .lines()
            .filter(|l| l.contains("ansible_ssh_private_key_file"))
            .count();
        assert_eq!(key_lines, 1);
        assert_eq!(inventory.hostname_to_server.len(), 2);
    }

    #[test]
    fn key_files_are_0600_and_unlinked_on_drop() {
        let master = "inventory-master-key";
        let encrypted = crypto::encrypt("secret key material", master).unwrap();
        let targets = vec![target("db-1", Some(&encrypted))];

        let inventory = build_inventory(&targets, master).unwrap();
        let path = inventory.key_files[0].path().to_path_buf();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        drop(inventory);
        assert!(!path.exists());
    }

    #[test]
    fn undecryptable_key_leaves_host_in_inventory() {
        let targets = vec![target("web-1", Some("not-a-valid-envelope"))];
        let inventory = build_inventory(&targets, "master").unwrap();

        assert!(inventory.yaml.contains("web-1:"));
        assert!(!inventory.yaml.contains("ansible_ssh_private_key_file"));
        assert_eq!(inventory.key_file_count(), 0);
    }

    #[test]
    fn run_summary_classification() {
        let summary = parse_run_summary(
            r#"{"stats": {
                "h1": {"ok": 5, "changed": 2},
                "h2": {"unreachable": 1},
                "h3": {"skipped": 3, "ok": 0},
                "h4": {"ok": 4, "failures": 1}
            }}"#,
        )
        .unwrap();

        assert_eq!(classify_recap(&summary.stats["h1"]), ("success", true));
        assert_eq!(classify_recap(&summary.stats["h2"]), ("failed", false));
        assert_eq!(classify_recap(&summary.stats["h3"]), ("skipped", false));
        assert_eq!(classify_recap(&summary.stats["h4"]), ("failed", false));
    }

    #[test]
    fn non_json_stdout_is_a_payload_error() {
        assert!(matches!(
            parse_run_summary("PLAY RECAP *****"),
            Err(DeployError::Payload(_))
        ));
    }

    #[test]
    fn extra_vars_render_strings_bare_and_rest_as_json() {
        let args = extra_var_args(&json!({
            "version": "1.2.3",
            "replicas": 4,
            "feature": true,
        }));

        let rendered: Vec<&str> = args.iter().map(String::as_str).collect();
        assert!(rendered.chunks(2).all(|c| c[0] == "-e"));
        assert!(rendered.contains(&"version=1.2.3"));
        assert!(rendered.contains(&"replicas=4"));
        assert!(rendered.contains(&"feature=true"));
    }
}
