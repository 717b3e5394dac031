//! Deterministic resource naming derived from workload identity.
//!
//! A name is `<prefix>-<hash>` where the prefix is the sanitized
//! `app-space` pair (or the guid when that is unusable) capped at
//! [`MAX_PREFIX_LEN`] chars and the hash is the first [`HASH_LEN`] hex chars
//! of sha256 over the identity. No lookups, no randomness.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{CapstanError, CapstanResult, Lrp, Task, WorkloadIdentity};

pub const MAX_PREFIX_LEN: usize = 40;
pub const HASH_LEN: usize = 10;

static VALID_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// First [`HASH_LEN`] hex chars of sha256(`input`).
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = hex::encode(digest);
    out.truncate(HASH_LEN);
    out
}

fn normalize(name: &str) -> String { name.to_lowercase().replace('_', "-") }

fn truncate(s: &str, max: usize) -> String { s.chars().take(max).collect() }

/// Lowercase `name` and map `_` to `-`; if the result is not a valid DNS label,
/// use `fallback` normalized the same way. Returns `None` when neither works.
pub fn sanitize_name(name: &str, fallback: &str) -> Option<String> {
    [name, fallback]
        .into_iter()
        .map(normalize)
        .find(|candidate| VALID_NAME.is_match(candidate))
        .map(|valid| truncate(&valid, MAX_PREFIX_LEN))
}

fn validate_identity(id: &WorkloadIdentity, require_version: bool) -> CapstanResult<()> {
    if id.guid.trim().is_empty() {
        return Err(CapstanError::validation("workload guid must not be empty"));
    }
    if require_version && id.version.trim().is_empty() {
        return Err(CapstanError::validation(format!("workload {} has an empty version", id.guid)));
    }
    Ok(())
}

fn prefix_for(app_name: &str, space_name: &str, guid: &str) -> CapstanResult<String> {
    sanitize_name(&format!("{app_name}-{space_name}"), guid)
        .ok_or_else(|| CapstanError::validation(format!("cannot derive a resource name from guid {guid:?}")))
}

/// Name of the stateful set backing `lrp`.
pub fn statefulset_name(lrp: &Lrp) -> CapstanResult<String> {
    validate_identity(&lrp.identity, true)?;
    let prefix = prefix_for(&lrp.app_name, &lrp.space_name, &lrp.identity.guid)?;
    Ok(format!("{prefix}-{}", short_hash(&lrp.identity.process_guid())))
}

/// Name of the job backing `task`. Tasks are keyed by guid alone.
pub fn job_name(task: &Task) -> CapstanResult<String> {
    validate_identity(&task.identity, false)?;
    let prefix = prefix_for(&task.app_name, &task.space_name, &task.identity.guid)?;
    Ok(format!("{prefix}-{}", short_hash(&task.identity.guid)))
}

/// Pull secret created for an LRP with a private registry.
pub fn registry_credentials_secret_name(statefulset_name: &str) -> String {
    format!("{statefulset_name}-registry-credentials")
}

/// Prefix shared by every pull secret created for a task of this app/space/guid.
pub fn task_registry_secret_prefix(app_name: &str, space_name: &str, guid: &str) -> CapstanResult<String> {
    Ok(format!("{}-registry-secret-", prefix_for(app_name, space_name, guid)?))
}

pub fn task_registry_secret_name(task: &Task) -> CapstanResult<String> {
    let prefix = task_registry_secret_prefix(&task.app_name, &task.space_name, &task.identity.guid)?;
    Ok(format!("{prefix}{}", short_hash(&task.identity.guid)))
}

/// Ordinal of a stateful set pod (`<statefulset>-<ordinal>`).
pub fn parse_pod_index(pod_name: &str) -> CapstanResult<u32> {
    pod_name
        .rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse::<u32>().ok())
        .ok_or_else(|| CapstanError::validation(format!("pod name {pod_name:?} has no ordinal suffix")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lrp(app: &str, space: &str, guid: &str, version: &str) -> Lrp {
        Lrp {
            identity: WorkloadIdentity::new(guid, version),
            app_name: app.into(),
            space_name: space.into(),
            ..Default::default()
        }
    }

    #[test]
    fn statefulset_name_uses_app_and_space() {
        let name = statefulset_name(&lrp("Baldur", "space-foo", "guid_1234", "version_1234")).unwrap();
        assert_eq!(name, "baldur-space-foo-34f869d015");
    }

    #[test]
    fn non_ascii_app_name_falls_back_to_guid() {
        let name = statefulset_name(&lrp("Балдър", "space-foo", "guid_1234", "version_1234")).unwrap();
        assert_eq!(name, "guid-1234-34f869d015");
    }

    #[test]
    fn long_prefix_is_truncated() {
        let app = "a".repeat(80);
        let name = statefulset_name(&lrp(&app, "s", "g", "v")).unwrap();
        let (prefix, hash) = name.rsplit_once('-').unwrap();
        assert_eq!(prefix.len(), MAX_PREFIX_LEN);
        assert_eq!(hash.len(), HASH_LEN);
    }

    #[test]
    fn malformed_identity_is_a_validation_error() {
        assert!(matches!(statefulset_name(&lrp("a", "s", "", "v")), Err(CapstanError::Validation(_))));
        assert!(matches!(statefulset_name(&lrp("a", "s", "g", " ")), Err(CapstanError::Validation(_))));
        assert!(matches!(statefulset_name(&lrp("ä", "ö", "ü!", "v")), Err(CapstanError::Validation(_))));
    }

    #[test]
    fn registry_secret_names_share_the_deleter_prefix() {
        let task = Task {
            identity: WorkloadIdentity::new("tguid", ""),
            app_name: "app".into(),
            space_name: "space".into(),
            ..Default::default()
        };
        let prefix = task_registry_secret_prefix("app", "space", "tguid").unwrap();
        assert_eq!(prefix, "app-space-registry-secret-");
        assert!(task_registry_secret_name(&task).unwrap().starts_with(&prefix));
        assert_eq!(registry_credentials_secret_name("x-1"), "x-1-registry-credentials");
    }

    #[test]
    fn pod_index_parses_ordinal_suffix() {
        assert_eq!(parse_pod_index("baldur-space-foo-34f869d015-3").unwrap(), 3);
        assert!(parse_pod_index("no_ordinal").is_err());
        assert!(parse_pod_index("trailing-").is_err());
    }

    // xorshift so the sample is reproducible without extra deps
    struct Rng(u64);
    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
        fn pick(&mut self, chars: &[char]) -> char { chars[(self.next() % chars.len() as u64) as usize] }
        fn string(&mut self, chars: &[char], max: usize) -> String {
            let len = 1 + (self.next() % max as u64) as usize;
            (0..len).map(|_| self.pick(chars)).collect()
        }
    }

    #[test]
    fn names_are_deterministic_valid_and_distinct() {
        let name_chars: Vec<char> = "abcXYZ019-_. Ωжß漢".chars().collect();
        let guid_chars: Vec<char> = "0123456789abcdef-".chars().collect();
        let mut rng = Rng(0x9e3779b97f4a7c15);
        let mut seen: HashMap<String, WorkloadIdentity> = HashMap::new();

        for _ in 0..2000 {
            let l = lrp(
                &rng.string(&name_chars, 30),
                &rng.string(&name_chars, 12),
                &format!("g{}0", rng.string(&guid_chars, 36)),
                &rng.string(&guid_chars, 12),
            );
            let name = statefulset_name(&l).unwrap();
            assert_eq!(name, statefulset_name(&l).unwrap());
            assert!(VALID_NAME.is_match(&name), "invalid name {name}");
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            assert!(name.len() <= MAX_PREFIX_LEN + 1 + HASH_LEN);

            if let Some(prev) = seen.insert(name.clone(), l.identity.clone()) {
                assert_eq!(prev, l.identity, "collision on {name}");
            }
        }
    }
}
