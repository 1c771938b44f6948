//! Rule configuration loading from JSON file storage

use crate::config::RuleConfig;
use std::path::Path;
use tokio::fs;

/// Load rule configurations from a JSON file.
///
/// A missing file yields no rules. Entries that fail to parse are skipped
/// individually so one broken rule does not disable the others.
pub async fn load_rules(path: &Path) -> Vec<RuleConfig> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No rules file found at {:?}", path);
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!("Failed to read rules file {:?}: {}", path, e);
            return Vec::new();
        }
    };

    let entries = match serde_json::from_str::<Vec<serde_json::Value>>(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to parse rules file {:?}: {}", path, e);
            return Vec::new();
        }
    };

    let rules: Vec<RuleConfig> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(rule) => Some(rule),
            Err(e) => {
                tracing::warn!("Skipping rule #{} in {:?}: {}", index, path, e);
                None
            }
        })
        .collect();

    tracing::info!("Loaded {} rules from {:?}", rules.len(), path);
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("light-motion-rules-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_missing_file_yields_no_rules() {
        assert!(load_rules(&temp_path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_entry_skipped() {
        let path = temp_path();
        fs::write(
            &path,
            r#"[
                {"id": "hall", "security_sensors": ["m"], "lights": ["l"], "duration": 60},
                {"id": "broken", "lights": ["l"]}
            ]"#,
        )
        .await
        .unwrap();

        let rules = load_rules(&path).await;
        let _ = fs::remove_file(&path).await;

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "hall");
        assert_eq!(rules[0].duration, 60);
    }

    #[tokio::test]
    async fn test_invalid_json_yields_no_rules() {
        let path = temp_path();
        fs::write(&path, "not json").await.unwrap();
        let rules = load_rules(&path).await;
        let _ = fs::remove_file(&path).await;
        assert!(rules.is_empty());
    }
}
