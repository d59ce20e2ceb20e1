//! Unlabeled sample sources and the data-isolation contract

use crate::model::Image;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Shift metadata attached to a sample
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTag {
    /// Corruption identifier, e.g. `gaussian_noise`
    pub corruption: String,
    pub severity: u8,
}

/// One unlabeled sample. There is no mask field.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: String,
    /// Path the sample was resolved from
    pub origin: PathBuf,
    pub image: Image,
    pub domain: DomainTag,
}

/// Stream of unlabeled batches
pub trait SampleSource {
    /// Every root this source may resolve paths under
    fn roots(&self) -> Vec<PathBuf>;

    /// Next batch; `None` when the stream has nothing more right now
    fn next_batch(&mut self) -> Result<Option<Vec<Sample>>>;

    /// Discard up to `n` batches; returns how many were skipped
    fn skip_batches(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if self.next_batch()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }
}

/// Partitions the engine must never read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolationPolicy {
    /// Training and held-out evaluation roots
    pub forbidden_roots: Vec<PathBuf>,
}

impl IsolationPolicy {
    /// Create a policy
    pub fn new(forbidden_roots: Vec<PathBuf>) -> Self {
        Self { forbidden_roots }
    }

    /// Add a forbidden root
    pub fn forbid(mut self, root: impl Into<PathBuf>) -> Self {
        self.forbidden_roots.push(root.into());
        self
    }

    /// Fail if `root` lies inside or contains a forbidden root
    pub fn check_root(&self, root: &Path) -> Result<()> {
        let root_n = resolve(root)?;
        for forbidden in &self.forbidden_roots {
            let forbidden_n = resolve(forbidden)?;
            if root_n.starts_with(&forbidden_n) || forbidden_n.starts_with(&root_n) {
                return Err(AdaptError::DataIsolationViolation {
                    path: root.to_path_buf(),
                    root: forbidden.clone(),
                });
            }
        }
        Ok(())
    }

    /// Fail if a resolved sample path lies inside a forbidden root
    pub fn check_path(&self, path: &Path) -> Result<()> {
        let path_n = resolve(path)?;
        for forbidden in &self.forbidden_roots {
            if path_n.starts_with(resolve(forbidden)?) {
                return Err(AdaptError::DataIsolationViolation {
                    path: path.to_path_buf(),
                    root: forbidden.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Anchor relative paths at the working directory, then normalize
fn resolve(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&std::env::current_dir()?.join(path)))
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Source verified against an [`IsolationPolicy`]; the only source the orchestrator accepts
#[derive(Debug)]
pub struct IsolatedSource<S> {
    inner: S,
    policy: IsolationPolicy,
}

impl<S: SampleSource> IsolatedSource<S> {
    /// Verify every source root before any sample is read
    pub fn new(source: S, policy: IsolationPolicy) -> Result<Self> {
        let roots = source.roots();
        for root in &roots {
            policy.check_root(root)?;
        }
        info!(
            roots = roots.len(),
            forbidden = policy.forbidden_roots.len(),
            "Sample source passed isolation check"
        );
        Ok(Self {
            inner: source,
            policy,
        })
    }

    /// Next batch with every origin re-checked
    pub fn next_batch(&mut self) -> Result<Option<Vec<Sample>>> {
        let batch = self.inner.next_batch()?;
        if let Some(samples) = &batch {
            for sample in samples {
                self.policy.check_path(&sample.origin)?;
            }
        }
        Ok(batch)
    }

    /// Fast-forward past already consumed batches; skipped origins are checked too
    pub fn skip_batches(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if self.next_batch()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Wrapped source
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Wrapped source, e.g. to feed more data into a paused run
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

/// In-memory source of pre-built batches
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    roots: Vec<PathBuf>,
    batches: VecDeque<Vec<Sample>>,
    reads: usize,
}

impl MemorySource {
    /// Source that claims `roots`
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            batches: VecDeque::new(),
            reads: 0,
        }
    }

    /// Queue a batch
    pub fn push_batch(&mut self, batch: Vec<Sample>) {
        self.batches.push_back(batch);
    }

    /// Queue several batches
    pub fn with_batches(mut self, batches: impl IntoIterator<Item = Vec<Sample>>) -> Self {
        self.batches.extend(batches);
        self
    }

    /// Batches handed out so far
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Batches still queued
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl SampleSource for MemorySource {
    fn roots(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Sample>>> {
        let batch = self.batches.pop_front();
        if batch.is_some() {
            self.reads += 1;
        }
        Ok(batch)
    }
}
