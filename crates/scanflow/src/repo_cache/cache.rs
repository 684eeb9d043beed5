use std::fs::OpenOptions;
use std::path::PathBuf;

use fs2::FileExt;
use uuid::Uuid;

use crate::error::ScanError;

#[derive(Clone)]
pub struct RepoCache {
    root: PathBuf,
}

pub struct Checkout {
    pub path: PathBuf,
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl RepoCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn mirror_path(&self, repo_slug: &str) -> PathBuf {
        self.root.join("mirrors").join(format!("{}.git", sanitize(repo_slug)))
    }

    fn lock_path(&self, repo_slug: &str) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", sanitize(repo_slug)))
    }

    /// Ensures a bare mirror of `repo_slug` exists and is up to date,
    /// cloning it on first use and fetching otherwise. Serialized per slug
    /// via an advisory file lock so two dispatch loops racing on the same
    /// repo don't fetch concurrently into the same mirror.
    pub fn ensure_mirror(&self, repo_slug: &str, clone_url: &str) -> Result<(), ScanError> {
        std::fs::create_dir_all(self.root.join("mirrors"))
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;
        std::fs::create_dir_all(self.root.join("locks"))
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;

        let lock_path = self.lock_path(repo_slug);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;

        let result = self.sync_mirror(repo_slug, clone_url);

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn sync_mirror(&self, repo_slug: &str, clone_url: &str) -> Result<(), ScanError> {
        let mirror = self.mirror_path(repo_slug);

        if mirror.exists() {
            let repo = git2::Repository::open_bare(&mirror)
                .map_err(|e| ScanError::RepositoryUnreachable(e.to_string()))?;
            let mut remote = repo
                .find_remote("origin")
                .map_err(|e| ScanError::RepositoryUnreachable(e.to_string()))?;
            remote
                .fetch(&["+refs/heads/*:refs/heads/*"], None, None)
                .map_err(|e| ScanError::RepositoryUnreachable(e.to_string()))?;
        } else {
            git2::build::RepoBuilder::new()
                .bare(true)
                .clone(clone_url, &mirror)
                .map_err(|e| ScanError::RepositoryUnreachable(e.to_string()))?;
        }

        Ok(())
    }

    /// Checks out `commit_sha` into a fresh ephemeral worktree. The caller
    /// owns the returned `Checkout`; dropping it removes the worktree so the
    /// cache directory doesn't grow without bound across many jobs.
    pub fn checkout(&self, repo_slug: &str, commit_sha: &str) -> Result<Checkout, ScanError> {
        let mirror = self.mirror_path(repo_slug);
        let repo = git2::Repository::open_bare(&mirror)
            .map_err(|e| ScanError::RepositoryUnreachable(e.to_string()))?;

        let oid = git2::Oid::from_str(commit_sha)
            .map_err(|_| ScanError::CommitMissing(commit_sha.to_string()))?;
        let commit = repo
            .find_commit(oid)
            .map_err(|_| ScanError::CommitMissing(commit_sha.to_string()))?;

        let work_dir = self
            .root
            .join("work")
            .join(sanitize(repo_slug))
            .join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&work_dir).map_err(|e| ScanError::CheckoutIo(e.to_string()))?;

        let tree = commit.tree().map_err(|e| ScanError::CheckoutIo(e.to_string()))?;
        let mut opts = git2::build::CheckoutBuilder::new();
        opts.target_dir(&work_dir).force();
        repo.checkout_tree(tree.as_object(), Some(&mut opts))
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;

        Ok(Checkout { path: work_dir })
    }

    /// Removes mirror directories unused since `older_than_days`, the way a
    /// periodic GC sweep trims a build cache that otherwise grows forever.
    pub fn gc_stale_mirrors(&self, older_than_days: u64) -> Result<u64, ScanError> {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(older_than_days * 86_400);
        let mirrors_dir = self.root.join("mirrors");
        if !mirrors_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in std::fs::read_dir(&mirrors_dir).map_err(|e| ScanError::CheckoutIo(e.to_string()))? {
            let entry = entry.map_err(|e| ScanError::CheckoutIo(e.to_string()))?;
            let meta = entry.metadata().map_err(|e| ScanError::CheckoutIo(e.to_string()))?;
            let modified = meta.modified().unwrap_or(std::time::SystemTime::now());
            if modified < cutoff {
                std::fs::remove_dir_all(entry.path()).map_err(|e| ScanError::CheckoutIo(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn sanitize(repo_slug: &str) -> String {
    repo_slug.replace(['/', '\\', ' '], "_")
}
