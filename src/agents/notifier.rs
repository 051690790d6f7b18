use crate::error::Result;
use crate::model::{CandidateVersion, CompositeApp, ManagedUnit};
use reqwest::blocking::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Outbound notification transport.
pub trait Notifier: Send + Sync {
    /// Returns whether the message was delivered.
    fn send(&self, message: &str) -> Result<bool>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &str) -> Result<bool> {
        info!(target: "stackbump::notify", "{message}");
        Ok(true)
    }
}

/// Posts `{"text": message}` to a chat-style incoming webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("stackbump/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn send(&self, message: &str) -> Result<bool> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()?;

        if response.status().is_success() {
            Ok(true)
        } else {
            warn!(status = %response.status(), "webhook rejected notification");
            Ok(false)
        }
    }
}

/// Render newly discovered candidates, one line per composite app or standalone
/// unit. `None` when there is nothing to report.
pub fn build_update_message(
    units: &[ManagedUnit],
    apps: &[CompositeApp],
    candidates: &[CandidateVersion],
) -> Option<String> {
    let mut lines: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for candidate in candidates.iter().filter(|c| !c.ignored && !c.notified) {
        let Some(unit) = candidate
            .unit_ids
            .iter()
            .find_map(|id| units.iter().find(|u| u.id == *id))
        else {
            continue;
        };

        let label = apps
            .iter()
            .find(|a| a.unit_ids.contains(&unit.id))
            .map(|a| a.name.clone())
            .unwrap_or_else(|| unit.name.clone());

        let mut line = format!(
            "{} → {}",
            unit.version.as_deref().unwrap_or("?"),
            candidate.version
        );
        if candidate.prerelease {
            line.push_str(" (prerelease)");
        }
        if candidate.is_breaking() {
            line.push_str(" [breaking]");
        }
        if candidate.suspected_malicious == Some(true) {
            line.push_str(" [suspected malicious]");
        }

        let entry = lines.entry(label).or_default();
        if !entry.contains(&line) {
            entry.push(line);
        }
    }

    if lines.is_empty() {
        return None;
    }

    let mut message = String::from("New versions available:");
    for (label, versions) in lines {
        message.push_str(&format!("\n- {label}: {}", versions.join(", ")));
    }
    Some(message)
}

/// Announce a finished rollout. `label` is the composite app when the unit has one.
pub fn build_applied_message(label: &str, previous: Option<&str>, new_version: &str, units: usize) -> String {
    let noun = if units == 1 { "unit" } else { "units" };
    format!(
        "Updated {label} {} → {new_version} ({units} {noun})",
        previous.unwrap_or("?")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_collapses_composite_apps() {
        let units = vec![
            ManagedUnit::new(1, 1, "immich-server", "ghcr.io/immich-app/immich-server:v2.2.3"),
            ManagedUnit::new(2, 1, "immich-ml", "ghcr.io/immich-app/immich-machine-learning:v2.2.3"),
            ManagedUnit::new(3, 1, "adguard", "adguard/adguardhome:v0.107.69"),
        ];
        let apps = vec![CompositeApp {
            name: "immich".into(),
            stack_id: 1,
            unit_ids: vec![1, 2],
        }];

        let mut breaking = CandidateVersion::new("v0.108.0", vec![3]);
        breaking.breaking = true;
        let mut notified = CandidateVersion::new("v0.107.70", vec![3]);
        notified.notified = true;
        let candidates = vec![
            CandidateVersion::new("v2.3.0", vec![1]),
            CandidateVersion::new("v2.3.0", vec![2]),
            notified,
            breaking,
        ];

        let message = build_update_message(&units, &apps, &candidates).unwrap();
        assert_eq!(
            message,
            "New versions available:\n- adguard: v0.107.69 → v0.108.0 [breaking]\n- immich: v2.2.3 → v2.3.0"
        );
    }

    #[test]
    fn applied_message_names_app_and_unit_count() {
        assert_eq!(
            build_applied_message("immich", Some("v2.2.3"), "v2.3.0", 2),
            "Updated immich v2.2.3 → v2.3.0 (2 units)"
        );
        assert_eq!(
            build_applied_message("adguard", None, "v0.108.0", 1),
            "Updated adguard ? → v0.108.0 (1 unit)"
        );
    }

    #[test]
    fn nothing_to_report() {
        let units = vec![ManagedUnit::new(1, 1, "a", "a:1.0")];
        let mut ignored = CandidateVersion::new("1.1", vec![1]);
        ignored.ignored = true;
        assert!(build_update_message(&units, &[], &[ignored]).is_none());
    }
}
