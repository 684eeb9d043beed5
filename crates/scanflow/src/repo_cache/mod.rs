//! Local checkout cache.
//!
//! The underlying VCS is out of scope as a system to model, but the
//! Dispatcher still needs a concrete checkout on disk to hand to the
//! scanner binary. Each repo is cloned once as a bare mirror under
//! `repo_cache_dir/<slug>.git`; every ScanJob gets its own ephemeral worktree
//! checked out from that mirror so concurrent jobs against the same repo
//! never share a working tree. An `fs2` advisory file lock serializes
//! mirror fetches per repo slug, the way a single-writer-many-readers cache
//! is conventionally guarded when there is no database to arbitrate it.

mod cache;

pub use cache::{Checkout, RepoCache};
