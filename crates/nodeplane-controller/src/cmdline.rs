//! Kernel command line parameters.

use nodeplane_core::Result;
use std::path::Path;

pub const PROC_CMDLINE: &str = "/proc/cmdline";
pub const KERNEL_PARAM_SIDEROLINK: &str = "siderolink.api";

/// Parsed `key=value` parameters. Keys may repeat; lookups return the first value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    params: Vec<(String, Option<String>)>,
}

impl Cmdline {
    pub fn parse(line: &str) -> Self {
        let params = line
            .split_whitespace()
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.trim_matches('"').to_string())),
                None => (token.to_string(), None),
            })
            .collect();
        Self { params }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let line = std::fs::read_to_string(path)?;
        Ok(Self::parse(&line))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }
}
