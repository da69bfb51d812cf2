//! Installer image references: `[registry/]repository[:tag][@digest]`.

use nodeplane_core::{Error, Result};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::validation("image reference is empty"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (reference, None),
        };

        // a tag colon comes after the last slash; a port colon does not
        let (name, tag) = match name.rfind(':') {
            Some(idx) if !name[idx..].contains('/') => (&name[..idx], Some(&name[idx + 1..])),
            _ => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first), rest)
            }
            _ => (None, name),
        };

        let repo_re = Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
            .map_err(|e| Error::Internal(e.to_string()))?;
        if !repo_re.is_match(repository) {
            return Err(Error::validation(format!(
                "invalid image repository {:?} in {:?}",
                repository, reference
            )));
        }

        if let Some(tag) = tag {
            let tag_re = Regex::new(r"^[\w][\w.-]{0,127}$").map_err(|e| Error::Internal(e.to_string()))?;
            if !tag_re.is_match(tag) {
                return Err(Error::validation(format!("invalid image tag {:?}", tag)));
            }
        }

        if let Some(digest) = digest {
            let digest_re = Regex::new(r"^sha256:[a-f0-9]{64}$").map_err(|e| Error::Internal(e.to_string()))?;
            if !digest_re.is_match(digest) {
                return Err(Error::validation(format!("invalid image digest {:?}", digest)));
            }
        }

        Ok(Self {
            registry: registry.map(String::from),
            repository: repository.to_string(),
            tag: tag.map(String::from),
            digest: digest.map(String::from),
        })
    }

    /// Version label for the boot entry installed from this image.
    pub fn version_label(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => digest.trim_start_matches("sha256:").chars().take(12).collect(),
            (None, None) => "latest".to_string(),
        }
    }

    pub fn boot_entry(&self) -> String {
        format!("nodeplane-{}", self.version_label())
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
