//! Runtime-tunable settings.
//!
//! A key/value table with JSONB values. Values are held as raw JSON and
//! decoded on demand through the typed accessors, since different knobs
//! carry different scalar types.

use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::info;

use super::Result;

/// A JSONB setting value with typed accessors.
#[derive(Debug, Clone)]
pub struct JsonValue(pub Value);

impl JsonValue {
    pub fn as_int(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.0.as_bool()
    }

    /// String value; JSON strings come back unquoted.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Retention policy for telemetry rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSettings {
    pub retention_hours: i64,
    pub enabled: bool,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            enabled: true,
        }
    }
}

/// Read the retention policy, falling back to defaults.
///
/// A deployment that has not run migrations yet has no settings table; that
/// is tolerated with a log line rather than failing the cleanup run.
pub async fn retention_settings(pool: &PgPool) -> Result<RetentionSettings> {
    let mut settings = RetentionSettings::default();

    let rows = sqlx::query(
        "SELECT key, value FROM settings WHERE key IN ('retention_hours', 'retention_enabled')",
    )
    .fetch_all(pool)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P01") => {
            info!("settings table not found, using retention defaults (24h, enabled)");
            return Ok(settings);
        }
        Err(e) => return Err(e.into()),
    };

    for row in rows {
        let key: String = row.get("key");
        let value = JsonValue(row.get::<Value, _>("value"));
        match key.as_str() {
            "retention_hours" => {
                if let Some(hours) = value.as_int() {
                    settings.retention_hours = hours;
                }
            }
            "retention_enabled" => {
                if let Some(enabled) = value.as_bool() {
                    settings.enabled = enabled;
                }
            }
            _ => {}
        }
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors() {
        assert_eq!(JsonValue(json!(48)).as_int(), Some(48));
        assert_eq!(JsonValue(json!(true)).as_bool(), Some(true));
        assert_eq!(JsonValue(json!("pro")).as_str(), Some("pro"));
        assert!(JsonValue(json!(null)).is_null());

        // Wrong-typed reads are None, not panics.
        assert_eq!(JsonValue(json!("48")).as_int(), None);
        assert_eq!(JsonValue(json!(1)).as_bool(), None);
    }

    #[test]
    fn retention_defaults() {
        let settings = RetentionSettings::default();
        assert_eq!(settings.retention_hours, 24);
        assert!(settings.enabled);
    }
}
