//! Run identifiers.
//!
//! A run id names the log file, the run directory and the encrypted archive, so it
//! must stay filesystem-safe: `[A-Za-z0-9._-]` only.

use anyhow::{Result, anyhow};

/// Upper bound on the numeric suffix used to disambiguate ids created in the same second.
pub const MAX_SUFFIX: u32 = 999;

/// Filesystem-safe short name of a pipeline.
///
/// Strips any namespace prefix (`nf-core/rnaseq` becomes `rnaseq`) and replaces every
/// character outside `[A-Za-z0-9._-]` with `-`.
pub fn pipeline_slug(pipeline: &str) -> String {
    let short = pipeline.trim().rsplit('/').next().unwrap_or_default();
    let slug: String = short
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('.').to_string();
    if slug.is_empty() {
        "pipeline".to_string()
    } else {
        slug
    }
}

/// Base id for a run created at `timestamp` (already formatted, e.g. `2024-05-01_10-00-00`).
pub fn base_run_id(pipeline: &str, timestamp: &str) -> String {
    format!("{}_{timestamp}_run", pipeline_slug(pipeline))
}

/// Candidate ids in preference order: `base`, `base-2`, ..., `base-999`.
pub fn candidate_ids(base: &str) -> impl Iterator<Item = String> + '_ {
    (1..=MAX_SUFFIX).map(move |suffix| {
        if suffix == 1 {
            base.to_string()
        } else {
            format!("{base}-{suffix}")
        }
    })
}

pub fn validate_run_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("run id must not be empty"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("run id must not start with '.' (got '{id}')"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("run id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_strips_namespace() {
        assert_eq!(pipeline_slug("nf-core/rnaseq"), "rnaseq");
        assert_eq!(pipeline_slug("org/group/my pipe"), "my-pipe");
        assert_eq!(pipeline_slug("  demo  "), "demo");
        assert_eq!(pipeline_slug("nf-core/"), "pipeline");
        assert_eq!(pipeline_slug(".."), "pipeline");
    }

    #[test]
    fn base_id_embeds_timestamp() {
        let id = base_run_id("nf-core/rnaseq", "2024-05-01_10-00-00");
        assert_eq!(id, "rnaseq_2024-05-01_10-00-00_run");
        validate_run_id(&id).expect("valid id");
    }

    #[test]
    fn candidates_append_suffixes() {
        let ids: Vec<String> = candidate_ids("demo_run").take(3).collect();
        assert_eq!(ids, vec!["demo_run", "demo_run-2", "demo_run-3"]);
        assert_eq!(candidate_ids("x").count(), MAX_SUFFIX as usize);
    }

    #[test]
    fn validate_rejects_path_tricks() {
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id("..").is_err());
        assert!(validate_run_id(".hidden").is_err());
        let err = validate_run_id("bad id").unwrap_err();
        assert!(err.to_string().contains("[A-Za-z0-9._-]"));
    }
}
