//! Two-slot boot configuration
//!
//! The node boots the `default` entry. Installing a new entry keeps the
//! displaced default around as `fallback` so a bad upgrade can be reverted;
//! any other entry on the boot partition is removed.

use nodeplane_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    default: Option<String>,
    fallback: Option<String>,
    entries: BTreeSet<String>,
}

impl BootConfig {
    /// Configuration of a node booted from `entry`.
    pub fn booted_from(entry: impl Into<String>) -> Self {
        let entry = entry.into();
        Self {
            default: Some(entry.clone()),
            fallback: None,
            entries: BTreeSet::from([entry]),
        }
    }

    pub fn default_entry(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Entry the node would revert to.
    pub fn previous_label(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn install(&mut self, entry: &str) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|existing| {
                let is_default = self
                    .default
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case(existing));
                !is_default
            })
            .cloned()
            .collect();
        for old in stale {
            info!(entry = %old, "removing old boot entry");
            self.entries.remove(&old);
        }

        if let Some(current) = self.default.as_deref() {
            if !current.eq_ignore_ascii_case(entry) {
                self.fallback = Some(current.to_string());
            }
        }

        self.entries.insert(entry.to_string());
        self.default = Some(entry.to_string());
    }

    /// Boot the fallback entry next time. The current entry is kept and
    /// becomes the new fallback.
    pub fn revert(&mut self) -> Result<()> {
        let fallback = self
            .fallback
            .take()
            .ok_or_else(|| Error::precondition("no fallback boot entry to revert to"))?;
        self.fallback = self.default.replace(fallback);
        Ok(())
    }
}
