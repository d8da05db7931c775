use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::agent::definition::Agent;
use crate::approval::record::ApprovalRecord;
use crate::broker::history::HistoryEntry;
use crate::broker::subscription::Relationships;
use crate::task::task::Task;
use crate::utils::retry::retry;

use super::error::StoreError;
use super::journal::{Entity, Journal, Mutation, Op};

pub const REGISTRY_DIR_NAME: &str = ".nox-registry";
pub const METRICS_DIR_NAME: &str = "metrics";

const AGENTS_FILE: &str = "agents.json";
const RELATIONSHIPS_FILE: &str = "agent-relationships.json";
const TASKS_DIR: &str = "tasks";
const MESSAGES_DIR: &str = "messages";
const APPROVALS_DIR: &str = "approvals";
const PENDING_APPROVALS_FILE: &str = "pending.json";
const APPROVAL_HISTORY_FILE: &str = "history.jsonl";

const WRITE_ATTEMPTS: usize = 3;
/// First retry wait; the helper doubles it per attempt.
const WRITE_RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters shown by `registry-status`.
#[derive(Debug, PartialEq)]
pub struct RegistryStatus {
    pub path: PathBuf,
    pub agents: usize,
    pub tasks: usize,
    pub pending_approvals: usize,
    pub journal_degraded: bool,
}

/// The single durable owner of agents, tasks, approvals and message history.
///
/// All writers funnel through this store: every mutation appends a
/// write-ahead intent line, writes the data file atomically (temp file +
/// rename, with bounded retries) and finally commits to git when the
/// registry directory is a repository. Readers get decoded snapshots.
pub struct RegistryStore {
    registry_dir: PathBuf,
    metrics_dir: PathBuf,
    journal: Journal,
}

impl RegistryStore {
    /// Opens (and lays out) the store under `working_dir`.
    pub fn open(working_dir: &Path) -> Result<Self, StoreError> {
        let registry_dir = working_dir.join(REGISTRY_DIR_NAME);
        let metrics_dir = working_dir.join(METRICS_DIR_NAME);

        for dir in [
            registry_dir.join(TASKS_DIR),
            registry_dir.join(MESSAGES_DIR),
            registry_dir.join(APPROVALS_DIR),
            metrics_dir.join("agents"),
        ] {
            fs::create_dir_all(&dir)?;
        }

        let journal = Journal::open(&registry_dir);
        debug!(registry = %registry_dir.display(), "registry store opened");

        Ok(Self {
            registry_dir,
            metrics_dir,
            journal,
        })
    }

    pub fn registry_dir(&self) -> &Path {
        &self.registry_dir
    }

    pub fn is_journal_degraded(&self) -> bool {
        self.journal.is_degraded()
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Agents
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn save_agents(&self, agents: &[Agent], mutation: Mutation) -> Result<(), StoreError> {
        self.write_json(&self.registry_dir.join(AGENTS_FILE), &agents, mutation)
    }

    pub fn load_agents(&self) -> Result<Vec<Agent>, StoreError> {
        Ok(self
            .read_json(&self.registry_dir.join(AGENTS_FILE))?
            .unwrap_or_default())
    }

    pub fn save_relationships(&self, relationships: &Relationships) -> Result<(), StoreError> {
        self.write_json(
            &self.registry_dir.join(RELATIONSHIPS_FILE),
            relationships,
            Mutation::new(Op::Update, Entity::Relationships, "all"),
        )
    }

    pub fn load_relationships(&self) -> Result<Option<Relationships>, StoreError> {
        self.read_json(&self.registry_dir.join(RELATIONSHIPS_FILE))
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Tasks
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn save_task(&self, task: &Task, op: Op) -> Result<(), StoreError> {
        let id = task.id.to_string();
        self.write_json(
            &self.task_path(&id),
            task,
            Mutation::new(op, Entity::Task, id.clone()),
        )
    }

    pub fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let mutation = Mutation::new(Op::Delete, Entity::Task, id);
        self.journal.append_intent(&mutation)?;
        let path = self.task_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.journal.commit_mutation(&mutation);
        Ok(())
    }

    pub fn load_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(self.registry_dir.join(TASKS_DIR))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(task) = self.read_json::<Task>(&path)? {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.registry_dir.join(TASKS_DIR).join(format!("{id}.json"))
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Messages
    ////////////////////////////////////////////////////////////////////////////////////

    /// Appends one history entry to today's segment.
    pub fn append_message(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let mutation = Mutation::new(Op::Append, Entity::Message, entry.message.id.to_string());
        self.journal.append_intent(&mutation)?;

        let path = self.message_segment_path(Utc::now().date_naive());
        let line = serde_json::to_string(entry).map_err(StoreError::Encode)?;
        append_line(&path, &line)?;

        self.journal.commit_mutation(&mutation);
        Ok(())
    }

    pub fn load_messages_for_day(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, StoreError> {
        let path = self.message_segment_path(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        contents
            .lines()
            .map(|line| {
                serde_json::from_str(line).map_err(|err| StoreError::RegistryCorrupt {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    fn message_segment_path(&self, date: NaiveDate) -> PathBuf {
        self.registry_dir
            .join(MESSAGES_DIR)
            .join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Approvals
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn save_pending_approvals(
        &self,
        records: &[ApprovalRecord],
        mutation: Mutation,
    ) -> Result<(), StoreError> {
        self.write_json(
            &self.registry_dir.join(APPROVALS_DIR).join(PENDING_APPROVALS_FILE),
            &records,
            mutation,
        )
    }

    pub fn load_pending_approvals(&self) -> Result<Vec<ApprovalRecord>, StoreError> {
        Ok(self
            .read_json(
                &self.registry_dir.join(APPROVALS_DIR).join(PENDING_APPROVALS_FILE),
            )?
            .unwrap_or_default())
    }

    /// Journals one terminal approval transition.
    pub fn append_approval_history(&self, record: &ApprovalRecord) -> Result<(), StoreError> {
        let mutation = Mutation::new(Op::Append, Entity::Approval, record.id.to_string());
        self.journal.append_intent(&mutation)?;

        let path = self.registry_dir.join(APPROVALS_DIR).join(APPROVAL_HISTORY_FILE);
        let line = serde_json::to_string(record).map_err(StoreError::Encode)?;
        append_line(&path, &line)?;

        self.journal.commit_mutation(&mutation);
        Ok(())
    }

    pub fn load_approval_history(&self, limit: usize) -> Result<Vec<ApprovalRecord>, StoreError> {
        let path = self.registry_dir.join(APPROVALS_DIR).join(APPROVAL_HISTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        let records: Result<Vec<ApprovalRecord>, StoreError> = contents
            .lines()
            .map(|line| {
                serde_json::from_str(line).map_err(|err| StoreError::RegistryCorrupt {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })
            })
            .collect();
        let mut records = records?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Metrics (read-only consumers; not journaled)
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn save_system_metrics<T: Serialize>(&self, metrics: &T) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(metrics).map_err(StoreError::Encode)?;
        atomic_write(&self.metrics_dir.join("system-metrics.json"), &contents)
    }

    pub fn save_agent_metrics<T: Serialize>(
        &self,
        agent_id: &str,
        metrics: &T,
    ) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(metrics).map_err(StoreError::Encode)?;
        atomic_write(
            &self.metrics_dir.join("agents").join(format!("{agent_id}.json")),
            &contents,
        )
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Operational queries
    ////////////////////////////////////////////////////////////////////////////////////

    pub fn status(&self) -> Result<RegistryStatus, StoreError> {
        Ok(RegistryStatus {
            path: self.registry_dir.clone(),
            agents: self.load_agents()?.len(),
            tasks: self.load_tasks()?.len(),
            pending_approvals: self.load_pending_approvals()?.len(),
            journal_degraded: self.is_journal_degraded(),
        })
    }

    pub fn journal_tail(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        self.journal.tail(limit)
    }

    /// Case-insensitive substring search over agents and tasks.
    pub fn query(&self, term: &str) -> Result<Vec<String>, StoreError> {
        let needle = term.to_lowercase();
        let mut hits = Vec::new();

        for agent in self.load_agents()? {
            let serialized = serde_json::to_string(&agent).map_err(StoreError::Encode)?;
            if serialized.to_lowercase().contains(&needle) {
                hits.push(format!("agent {} ({})", agent.id, agent.name));
            }
        }
        for task in self.load_tasks()? {
            let serialized = serde_json::to_string(&task).map_err(StoreError::Encode)?;
            if serialized.to_lowercase().contains(&needle) {
                hits.push(format!("task {} ({})", task.id, task.title));
            }
        }
        Ok(hits)
    }

    /// Copies the registry tree (minus `.git`) into `dest`. Returns the
    /// number of files copied.
    pub fn backup(&self, dest: &Path) -> Result<usize, StoreError> {
        copy_tree(&self.registry_dir, dest)
    }

    ////////////////////////////////////////////////////////////////////////////////////
    // Primitives
    ////////////////////////////////////////////////////////////////////////////////////

    fn write_json<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        mutation: Mutation,
    ) -> Result<(), StoreError> {
        self.journal.append_intent(&mutation)?;

        let contents = serde_json::to_string_pretty(value).map_err(StoreError::Encode)?;
        retry(WRITE_ATTEMPTS, WRITE_RETRY_INITIAL_INTERVAL, || {
            atomic_write(path, &contents)
        })?;

        self.journal.commit_mutation(&mutation);
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StoreError::RegistryCorrupt {
                path: path.display().to_string(),
                reason: err.to_string(),
            })
    }
}

/// Writes via a sibling temp file and renames over the target, so readers
/// never observe a torn file.
fn atomic_write(path: &Path, contents: &str) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<usize, StoreError> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let target = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::tests::agent_spec;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    fn agents() -> Vec<Agent> {
        vec![
            Agent::from_spec(agent_spec("alpha")).unwrap(),
            Agent::from_spec(agent_spec("beta")).unwrap(),
        ]
    }

    #[test]
    fn open_lays_out_the_registry() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();

        assert!(store.registry_dir().join(TASKS_DIR).is_dir());
        assert!(store.registry_dir().join(MESSAGES_DIR).is_dir());
        assert!(store.registry_dir().join(APPROVALS_DIR).is_dir());
        assert!(dir.path().join(METRICS_DIR_NAME).join("agents").is_dir());
    }

    #[test]
    fn agents_round_trip() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();

        let agents = agents();
        store
            .save_agents(&agents, Mutation::new(Op::Create, Entity::Agent, "alpha"))
            .unwrap();

        assert_eq!(store.load_agents().unwrap(), agents);
    }

    #[test]
    fn load_agents_on_fresh_store_is_empty() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        assert!(store.load_agents().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_fatal_not_empty() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();

        fs::write(store.registry_dir().join(AGENTS_FILE), "{not json").unwrap();
        assert_matches!(
            store.load_agents(),
            Err(StoreError::RegistryCorrupt { .. })
        );
    }

    #[test]
    fn journal_records_every_mutation() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();

        store
            .save_agents(&agents(), Mutation::new(Op::Create, Entity::Agent, "alpha"))
            .unwrap();
        store
            .save_agents(&agents(), Mutation::new(Op::Update, Entity::Agent, "beta"))
            .unwrap();

        let tail = store.journal_tail(10).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("create agent alpha"));
        assert!(tail[1].ends_with("update agent beta"));
    }

    #[test]
    fn query_matches_on_any_field() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        store
            .save_agents(&agents(), Mutation::new(Op::Create, Entity::Agent, "alpha"))
            .unwrap();

        let hits = store.query("ALPHA").unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].starts_with("agent alpha"));

        assert!(store.query("no-such-thing").unwrap().is_empty());
    }

    #[test]
    fn backup_copies_the_tree() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        store
            .save_agents(&agents(), Mutation::new(Op::Create, Entity::Agent, "alpha"))
            .unwrap();

        let dest = tempdir().unwrap();
        let copied = store.backup(dest.path()).unwrap();
        assert!(copied >= 2); // agents.json + journal.log
        assert!(dest.path().join(AGENTS_FILE).exists());
    }
}
