//! Git pre-push guard.
//!
//! Pushing to the protected branch redeploys the hosted app, which drops
//! every exam in progress. The hook refuses such a push while an attempt
//! was active within the window, unless overridden.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};

pub const PROTECTED_REF: &str = "refs/heads/main";
pub const DEFAULT_WINDOW_MINUTES: i64 = 30;
pub const OVERRIDE_ENV: &str = "EXAM_PUSH_OVERRIDE";

const HOOK_SCRIPT: &str = "#!/bin/sh
# Installed by exam-ops
exec exam-ops pre-push \"$@\"
";

/// One line of git's pre-push stdin
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushedRef {
    pub local_ref: String,
    pub local_sha: String,
    pub remote_ref: String,
    pub remote_sha: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushDecision {
    Allow,
    Overridden { last_activity: DateTime<Utc> },
    Block { last_activity: DateTime<Utc> },
}

/// `<local ref> <local sha> <remote ref> <remote sha>` per line; others skipped
pub fn parse_pushed_refs(input: &str) -> Vec<PushedRef> {
    input
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pushed = PushedRef {
                local_ref: parts.next()?.to_string(),
                local_sha: parts.next()?.to_string(),
                remote_ref: parts.next()?.to_string(),
                remote_sha: parts.next()?.to_string(),
            };
            parts.next().is_none().then_some(pushed)
        })
        .collect()
}

pub fn touches(refs: &[PushedRef], protected: &str) -> bool {
    refs.iter().any(|r| r.remote_ref == protected)
}

pub fn decide(
    refs: &[PushedRef],
    protected: &str,
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
    override_push: bool,
) -> PushDecision {
    if !touches(refs, protected) {
        return PushDecision::Allow;
    }
    match last_activity {
        Some(last_activity) if now - last_activity < window => {
            if override_push {
                PushDecision::Overridden { last_activity }
            } else {
                PushDecision::Block { last_activity }
            }
        }
        _ => PushDecision::Allow,
    }
}

/// Write `.git/hooks/pre-push` under `repo_root`, keeping any foreign hook as `pre-push.bak`
pub fn install_hook(repo_root: &Path) -> anyhow::Result<PathBuf> {
    let git_dir = repo_root.join(".git");
    if !git_dir.is_dir() {
        bail!("{} is not a git repository", repo_root.display());
    }

    let hooks_dir = git_dir.join("hooks");
    fs::create_dir_all(&hooks_dir)
        .with_context(|| format!("creating {}", hooks_dir.display()))?;

    let hook = hooks_dir.join("pre-push");
    if hook.exists() {
        let existing = fs::read_to_string(&hook).unwrap_or_default();
        if existing != HOOK_SCRIPT {
            let backup = hooks_dir.join("pre-push.bak");
            fs::rename(&hook, &backup)
                .with_context(|| format!("backing up {}", hook.display()))?;
            tracing::warn!(backup = %backup.display(), "Existing pre-push hook moved aside");
        }
    }

    fs::write(&hook, HOOK_SCRIPT).with_context(|| format!("writing {}", hook.display()))?;
    make_executable(&hook)?;

    tracing::info!(hook = %hook.display(), "Installed pre-push hook");
    Ok(hook)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO: &str = "0000000000000000000000000000000000000000";

    fn push_to(remote_ref: &str) -> Vec<PushedRef> {
        parse_pushed_refs(&format!("refs/heads/dev abc123 {remote_ref} {ZERO}\n"))
    }

    #[test]
    fn test_parse_pushed_refs() {
        let refs = parse_pushed_refs(
            "refs/heads/main 1111 refs/heads/main 2222\n\nnot a ref line\nrefs/tags/v1 3333 refs/tags/v1 4444\n",
        );
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].remote_ref, "refs/heads/main");
        assert_eq!(refs[1].local_sha, "3333");
    }

    #[test]
    fn test_other_branch_always_allowed() {
        let now = Utc::now();
        let decision = decide(
            &push_to("refs/heads/feature"),
            PROTECTED_REF,
            Some(now),
            now,
            Duration::minutes(DEFAULT_WINDOW_MINUTES),
            false,
        );
        assert_eq!(decision, PushDecision::Allow);
    }

    #[test]
    fn test_recent_activity_blocks_main() {
        let now = Utc::now();
        let last = now - Duration::minutes(5);
        let window = Duration::minutes(DEFAULT_WINDOW_MINUTES);

        assert_eq!(
            decide(&push_to(PROTECTED_REF), PROTECTED_REF, Some(last), now, window, false),
            PushDecision::Block { last_activity: last }
        );
        assert_eq!(
            decide(&push_to(PROTECTED_REF), PROTECTED_REF, Some(last), now, window, true),
            PushDecision::Overridden { last_activity: last }
        );
    }

    #[test]
    fn test_stale_or_missing_activity_allows_main() {
        let now = Utc::now();
        let window = Duration::minutes(DEFAULT_WINDOW_MINUTES);

        let stale = now - Duration::minutes(45);
        assert_eq!(
            decide(&push_to(PROTECTED_REF), PROTECTED_REF, Some(stale), now, window, false),
            PushDecision::Allow
        );
        assert_eq!(
            decide(&push_to(PROTECTED_REF), PROTECTED_REF, None, now, window, false),
            PushDecision::Allow
        );
    }

    #[test]
    fn test_install_hook_writes_executable_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();

        let hook = install_hook(dir.path()).unwrap();
        assert_eq!(hook, dir.path().join(".git/hooks/pre-push"));
        assert!(fs::read_to_string(&hook).unwrap().contains("exam-ops pre-push"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&hook).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_install_hook_backs_up_foreign_hook() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = dir.path().join(".git/hooks");
        fs::create_dir_all(&hooks).unwrap();
        fs::write(hooks.join("pre-push"), "#!/bin/sh\necho custom\n").unwrap();

        install_hook(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(hooks.join("pre-push.bak")).unwrap(),
            "#!/bin/sh\necho custom\n"
        );

        // Reinstalling over our own hook leaves the backup alone
        install_hook(dir.path()).unwrap();
        assert!(hooks.join("pre-push.bak").exists());
    }

    #[test]
    fn test_install_hook_requires_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(install_hook(dir.path()).is_err());
    }
}
