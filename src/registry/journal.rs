use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use git2::Repository;
use tracing::{debug, warn};

use super::error::StoreError;

pub const JOURNAL_FILE: &str = "journal.log";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Create,
    Update,
    Delete,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Entity {
    Agent,
    Relationships,
    Task,
    Message,
    Approval,
}

/// One registry mutation, rendered as the machine-readable journal line and
/// git commit message `<op> <entity> <id>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    op: Op,
    entity: Entity,
    id: String,
}

impl Mutation {
    pub fn new(op: Op, entity: Entity, id: impl Into<String>) -> Self {
        Self {
            op,
            entity,
            id: id.into(),
        }
    }
}

impl Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Append => "append",
        };
        let entity = match self.entity {
            Entity::Agent => "agent",
            Entity::Relationships => "relationships",
            Entity::Task => "task",
            Entity::Message => "message",
            Entity::Approval => "approval",
        };
        write!(f, "{op} {entity} {}", self.id)
    }
}

/// Write-ahead journal over the registry directory, with best-effort git
/// commits when the directory is itself a git repository.
///
/// Appending the intent line is mandatory and its failure is fatal; the git
/// commit is optional and only degrades the journal health sub-status.
pub struct Journal {
    dir: PathBuf,
    repo: Option<Mutex<Repository>>,
    degraded: AtomicBool,
}

impl Journal {
    pub fn open(dir: &Path) -> Self {
        let repo = dir
            .join(".git")
            .is_dir()
            .then(|| Repository::open(dir).ok())
            .flatten();
        if repo.is_some() {
            debug!(dir = %dir.display(), "registry journal will commit mutations to git");
        }

        Self {
            dir: dir.to_path_buf(),
            repo: repo.map(Mutex::new),
            degraded: AtomicBool::new(false),
        }
    }

    /// Appends the mutation intent before the data write.
    pub fn append_intent(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let line = format!("{} {mutation}\n", Utc::now().to_rfc3339());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(JOURNAL_FILE))
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|err| StoreError::JournalWriteFailed(err.to_string()))
    }

    /// Commits the mutation after the data write. Best-effort: failures are
    /// logged and remembered as a degraded journal, never surfaced.
    pub fn commit_mutation(&self, mutation: &Mutation) {
        let Some(repo) = &self.repo else { return };

        let repo = repo.lock().unwrap();
        if let Err(err) = commit_all(&repo, &mutation.to_string()) {
            warn!(mutation = %mutation, "registry git commit failed: {err}");
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    /// Whether a git commit has failed since startup.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// The most recent `limit` journal lines, newest last.
    pub fn tail(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let path = self.dir.join(JOURNAL_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = contents.lines().collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines[skip..].iter().map(|s| s.to_string()).collect())
    }
}

fn commit_all(repo: &Repository, message: &str) -> Result<(), git2::Error> {
    let mut index = repo.index()?;
    index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree = repo.find_tree(index.write_tree()?)?;
    let signature = git2::Signature::now("nox", "nox@localhost")?;

    let parent = repo
        .head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();

    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &parents,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mutation_renders_as_op_entity_id() {
        let mutation = Mutation::new(Op::Create, Entity::Agent, "alpha");
        assert_eq!(mutation.to_string(), "create agent alpha");
    }

    #[test]
    fn intent_lines_accumulate_and_tail() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path());

        journal
            .append_intent(&Mutation::new(Op::Create, Entity::Agent, "alpha"))
            .unwrap();
        journal
            .append_intent(&Mutation::new(Op::Delete, Entity::Agent, "alpha"))
            .unwrap();

        let tail = journal.tail(1).unwrap();
        assert_eq!(tail.len(), 1);
        assert!(tail[0].ends_with("delete agent alpha"));
    }

    #[test]
    fn without_git_commit_is_a_no_op() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path());

        journal.commit_mutation(&Mutation::new(Op::Create, Entity::Task, "t1"));
        assert!(!journal.is_degraded());
    }

    #[test]
    fn with_git_every_mutation_becomes_a_commit() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("agents.json"), "[]").unwrap();

        let journal = Journal::open(dir.path());
        let mutation = Mutation::new(Op::Create, Entity::Agent, "alpha");
        journal.append_intent(&mutation).unwrap();
        journal.commit_mutation(&mutation);
        assert!(!journal.is_degraded());

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message().unwrap(), "create agent alpha");
    }
}
