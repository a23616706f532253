//! Push application
//!
//! A push is applied in two phases. The pack is decoded and every object
//! stored first; only then are ref updates attempted, each one a
//! compare-and-swap against the old value the client saw. A pack that fails
//! to decode moves no ref at all, and a ref only moves onto a commit whose
//! whole object graph is present.

use crate::areas::database::Database;
use crate::areas::refs::RefUpdate;
use crate::areas::repository::Repository;
use crate::artifacts::branch::branch_name::{BranchName, REF_PREFIX, SymRefName};
use crate::artifacts::objects::entry_mode::EntryMode;
use crate::artifacts::objects::object_id::ObjectId;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::pack::unpack_into;
use crate::protocol::pkt_line::{BAND_DATA, PktLine, PktLineReader, PktLineWriter};
use crate::sync::changes::RefMove;
use bytes::Bytes;
use std::collections::HashSet;
use std::io::Cursor;

/// One `<old> <new> <ref>` line of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    pub old: ObjectId,
    pub new: ObjectId,
    pub reference: String,
}

impl RefCommand {
    fn parse(line: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::Framing(format!("invalid command '{line}'"));
        let mut words = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(reference)) = (words.next(), words.next(), words.next()) else {
            return Err(invalid());
        };

        Ok(RefCommand {
            old: ObjectId::try_parse(old.to_string()).map_err(|_| invalid())?,
            new: ObjectId::try_parse(new.to_string()).map_err(|_| invalid())?,
            reference: reference.to_string(),
        })
    }

    pub fn is_create(&self) -> bool {
        self.old.is_zero()
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    fn expected(&self) -> Option<&ObjectId> {
        (!self.is_create()).then_some(&self.old)
    }

    fn target(&self) -> Option<&ObjectId> {
        (!self.is_delete()).then_some(&self.new)
    }
}

/// Commands, capabilities and pack of a receive-pack request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub commands: Vec<RefCommand>,
    pub capabilities: HashSet<String>,
    pub pack: Bytes,
}

impl ReceiveRequest {
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = PktLineReader::new(Cursor::new(body));
        let mut request = ReceiveRequest::default();

        while let Some(PktLine::Data(data)) = reader.read()? {
            let mut line = std::str::from_utf8(&data)
                .map_err(|_| ProtocolError::Framing("non-utf-8 command".to_string()))?;
            line = line.strip_suffix('\n').unwrap_or(line);

            if request.commands.is_empty()
                && let Some((command, capabilities)) = line.split_once('\0')
            {
                request
                    .capabilities
                    .extend(capabilities.split(' ').filter(|c| !c.is_empty()).map(str::to_string));
                line = command;
            }
            if line.starts_with("shallow ") {
                return Err(ProtocolError::Unsupported("shallow pushes".to_string()));
            }

            request.commands.push(RefCommand::parse(line)?);
        }

        let position = reader.into_inner().position() as usize;
        request.pack = Bytes::copy_from_slice(&body[position.min(body.len())..]);
        Ok(request)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Rejected(String),
}

/// What a push did: the report for the client and the refs that moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub unpack_error: Option<String>,
    pub statuses: Vec<(String, CommandStatus)>,
    pub accepted: Vec<RefMove>,
    pub report: Vec<u8>,
}

impl ReceiveOutcome {
    pub fn is_clean(&self) -> bool {
        self.unpack_error.is_none()
            && self
                .statuses
                .iter()
                .all(|(_, status)| *status == CommandStatus::Ok)
    }
}

/// Apply a push. No pack entry may inflate past `max_object_size`.
#[tracing::instrument(name = "receive_pack", skip_all, fields(backend = %repository.id()))]
pub fn receive_pack(repository: &Repository, body: &[u8], max_object_size: usize) -> ProtocolResult<ReceiveOutcome> {
    let request = ReceiveRequest::parse(body)?;

    let unpack_error = if request.pack.is_empty() {
        None
    } else {
        match unpack_into(&request.pack, repository.database(), max_object_size) {
            Ok(oids) => {
                tracing::debug!(objects = oids.len(), "unpacked push");
                None
            }
            Err(error) => {
                tracing::warn!(%error, "rejected pack");
                Some(error.to_string())
            }
        }
    };

    let known = match &unpack_error {
        Some(_) => HashSet::new(),
        None => known_commits(repository)?,
    };

    let mut statuses = Vec::with_capacity(request.commands.len());
    let mut accepted = Vec::new();
    for command in &request.commands {
        let status = match &unpack_error {
            Some(_) => CommandStatus::Rejected("unpacker error".to_string()),
            None => apply_command(repository, command, &known)?,
        };

        match &status {
            CommandStatus::Ok => {
                tracing::info!(
                    reference = %command.reference,
                    old = %command.old.to_short_oid(),
                    new = %command.new.to_short_oid(),
                    "ref updated by push"
                );
                accepted.push(RefMove {
                    reference: command.reference.clone(),
                    old: command.expected().cloned(),
                    new: command.target().cloned(),
                });
            }
            CommandStatus::Rejected(reason) => {
                tracing::warn!(reference = %command.reference, %reason, "ref update rejected");
            }
        }
        statuses.push((command.reference.clone(), status));
    }

    let report = if request.has_capability("report-status") {
        report_status(
            unpack_error.as_deref(),
            &statuses,
            request.has_capability("side-band-64k"),
        )?
    } else {
        Vec::new()
    };

    Ok(ReceiveOutcome {
        unpack_error,
        statuses,
        accepted,
        report,
    })
}

fn apply_command(
    repository: &Repository,
    command: &RefCommand,
    known: &HashSet<ObjectId>,
) -> ProtocolResult<CommandStatus> {
    let rejected = |reason: &str| -> ProtocolResult<CommandStatus> {
        Ok(CommandStatus::Rejected(reason.to_string()))
    };

    if !command.reference.starts_with(REF_PREFIX)
        || BranchName::try_parse_sym_ref_name(&SymRefName::new(command.reference.clone())).is_err()
    {
        return rejected("funny refname");
    }
    if command.is_create() && command.is_delete() {
        return rejected("nothing to do");
    }

    if let Some(new) = command.target() {
        let database = repository.database();
        if !matches!(database.parse_object_as_commit(new), Ok(Some(_))) {
            return rejected("not a commit");
        }
        if let Some(missing) = first_missing_object(database, new, known)? {
            tracing::warn!(reference = %command.reference, %missing, "push is missing objects");
            return rejected("missing necessary objects");
        }
    }

    let reference = SymRefName::new(command.reference.clone());
    match repository
        .refs()
        .compare_and_swap(&reference, command.expected(), command.target())
    {
        Ok(RefUpdate::Applied) => Ok(CommandStatus::Ok),
        Ok(RefUpdate::Stale { .. }) => rejected("stale info, fetch first"),
        // the remaining commands are still attempted
        Err(error) => {
            tracing::warn!(reference = %reference, error = format!("{error:#}"), "ref write failed");
            rejected("failed to update ref")
        }
    }
}

/// Commits reachable from the refs as they were before the push.
fn known_commits(repository: &Repository) -> anyhow::Result<HashSet<ObjectId>> {
    let database = repository.database();
    let mut pending = repository
        .refs()
        .list_refs()?
        .into_iter()
        .map(|(_, oid)| oid)
        .collect::<Vec<_>>();
    let mut known = HashSet::new();

    while let Some(oid) = pending.pop() {
        if !known.insert(oid.clone()) {
            continue;
        }
        let commit = database.load_commit(&oid)?;
        pending.extend(commit.parents().iter().cloned());
    }

    Ok(known)
}

/// The first object in the closure of commit `tip` that is not stored.
///
/// The walk stops at `known` commits, whose graphs are complete already.
fn first_missing_object(
    database: &Database,
    tip: &ObjectId,
    known: &HashSet<ObjectId>,
) -> anyhow::Result<Option<ObjectId>> {
    let mut commits = vec![tip.clone()];
    let mut trees = Vec::new();
    let mut visited = HashSet::new();

    while let Some(oid) = commits.pop() {
        if known.contains(&oid) || !visited.insert(oid.clone()) {
            continue;
        }
        if !database.exists(&oid) {
            return Ok(Some(oid));
        }
        let commit = database.load_commit(&oid)?;
        trees.push(commit.tree_oid().clone());
        commits.extend(commit.parents().iter().cloned());
    }

    while let Some(oid) = trees.pop() {
        if !visited.insert(oid.clone()) {
            continue;
        }
        if !database.exists(&oid) {
            return Ok(Some(oid));
        }
        for (_, entry) in database.load_tree(&oid)?.entries() {
            match entry.mode {
                EntryMode::Directory => trees.push(entry.oid.clone()),
                // gitlinks point into other repositories
                EntryMode::Gitlink => {}
                _ if !database.exists(&entry.oid) => return Ok(Some(entry.oid.clone())),
                _ => {}
            }
        }
    }

    Ok(None)
}

fn report_status(
    unpack_error: Option<&str>,
    statuses: &[(String, CommandStatus)],
    side_band: bool,
) -> ProtocolResult<Vec<u8>> {
    let mut report = PktLineWriter::new(Vec::new());
    match unpack_error {
        None => report.write_line("unpack ok")?,
        Some(error) => report.write_line(&format!("unpack {error}"))?,
    }
    for (reference, status) in statuses {
        match status {
            CommandStatus::Ok => report.write_line(&format!("ok {reference}"))?,
            CommandStatus::Rejected(reason) => report.write_line(&format!("ng {reference} {reason}"))?,
        }
    }
    report.flush_pkt()?;
    let report = report.into_inner();

    if !side_band {
        return Ok(report);
    }

    let mut framed = PktLineWriter::new(Vec::new());
    framed.write_band(BAND_DATA, &report)?;
    framed.flush_pkt()?;
    Ok(framed.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::objects::object_type::ObjectType;
    use crate::backend::registry::{BackendSettings, GIT_FLAVOR, Registry};
    use crate::backend::{Backend, CommitArgs};
    use crate::errors::BackendId;
    use crate::protocol::pack::PackWriter;
    use crate::protocol::upload_pack::reachable_objects;
    use assert_fs::TempDir;
    use pretty_assertions::assert_eq;

    const LIMIT: usize = 1024 * 1024;

    /// A source repository with one commit, and an empty target.
    fn source_and_target() -> (TempDir, TempDir, ObjectId) {
        let source = TempDir::new().unwrap();
        let mut backend = Registry::with_defaults(BackendSettings::default())
            .open(GIT_FLAVOR, source.path())
            .unwrap();
        backend.init_repo().unwrap();
        backend.write("a.txt", Bytes::from_static(b"hello")).unwrap();
        let tip = backend.commit(&CommitArgs::new("first")).unwrap().unwrap();

        let target = TempDir::new().unwrap();
        repository(&target).init().unwrap();
        (source, target, tip.revision().clone())
    }

    fn repository(dir: &TempDir) -> Repository {
        let id = BackendId::new(GIT_FLAVOR.to_string(), dir.path().to_path_buf());
        let branch = Repository::parse_default_branch(&id, "master").unwrap();
        Repository::open(id, branch)
    }

    fn pack_from(source: &Repository, tip: &ObjectId) -> Vec<u8> {
        let database = source.database();
        let objects = reachable_objects(database, std::slice::from_ref(tip), &HashSet::new()).unwrap();
        let mut writer = PackWriter::new(Vec::new(), objects.len() as u32).unwrap();
        for oid in &objects {
            let (object_type, content) = database.load_raw(oid).unwrap();
            writer.write_object(object_type, &content).unwrap();
        }
        writer.finish().unwrap()
    }

    fn push_body(commands: &[String], pack: &[u8]) -> Vec<u8> {
        let mut writer = PktLineWriter::new(Vec::new());
        for (index, command) in commands.iter().enumerate() {
            if index == 0 {
                writer.write_line(&format!("{command}\0report-status")).unwrap();
            } else {
                writer.write_line(command).unwrap();
            }
        }
        writer.flush_pkt().unwrap();
        let mut body = writer.into_inner();
        body.extend_from_slice(pack);
        body
    }

    #[test]
    fn commands_and_pack_are_split() {
        let zero = ObjectId::zero();
        let body = push_body(&[format!("{zero} {zero} refs/heads/master")], b"PACK...");

        let request = ReceiveRequest::parse(&body).unwrap();

        assert_eq!(request.commands.len(), 1);
        assert!(request.has_capability("report-status"));
        assert_eq!(request.pack, Bytes::from_static(b"PACK..."));
    }

    #[test]
    fn pushes_create_branches_and_report_ok() {
        let (source, target, tip) = source_and_target();
        let pack = pack_from(&repository(&source), &tip);
        let body = push_body(&[format!("{} {tip} refs/heads/master", ObjectId::zero())], &pack);

        let target = repository(&target);
        let outcome = receive_pack(&target, &body, LIMIT).unwrap();

        assert!(outcome.is_clean());
        assert_eq!(target.refs().read_ref(&SymRefName::new("refs/heads/master".to_string())).unwrap(), Some(tip.clone()));
        assert_eq!(
            outcome.accepted,
            vec![RefMove {
                reference: "refs/heads/master".to_string(),
                old: None,
                new: Some(tip),
            }]
        );
        let report = String::from_utf8(outcome.report).unwrap();
        assert_eq!(report, "000eunpack ok\n0019ok refs/heads/master\n0000");
    }

    #[test]
    fn stale_old_values_are_rejected() {
        let (source, target, tip) = source_and_target();
        let pack = pack_from(&repository(&source), &tip);
        let body = push_body(&[format!("{tip} {tip} refs/heads/master")], &pack);

        let outcome = receive_pack(&repository(&target), &body, LIMIT).unwrap();

        assert!(outcome.accepted.is_empty());
        assert_eq!(
            outcome.statuses,
            vec![(
                "refs/heads/master".to_string(),
                CommandStatus::Rejected("stale info, fetch first".to_string())
            )]
        );
    }

    #[test]
    fn corrupt_packs_move_no_refs() {
        let (source, target, tip) = source_and_target();
        let mut pack = pack_from(&repository(&source), &tip);
        let last = pack.len() - 1;
        pack[last] ^= 0xff;
        let body = push_body(&[format!("{} {tip} refs/heads/master", ObjectId::zero())], &pack);

        let target = repository(&target);
        let outcome = receive_pack(&target, &body, LIMIT).unwrap();

        assert!(outcome.unpack_error.is_some());
        assert!(outcome.accepted.is_empty());
        assert!(target.refs().list_refs().unwrap().is_empty());
    }

    #[test]
    fn non_commits_and_foreign_refs_are_refused() {
        let (_source, target, _) = source_and_target();
        let target = repository(&target);
        let blob = target.database().store_raw(ObjectType::Blob, b"x").unwrap();
        let zero = ObjectId::zero();
        let body = push_body(
            &[
                format!("{zero} {blob} refs/heads/master"),
                format!("{zero} {blob} refs/tags/v1"),
            ],
            &[],
        );

        let outcome = receive_pack(&target, &body, LIMIT).unwrap();

        let reasons = outcome
            .statuses
            .iter()
            .map(|(_, status)| status.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                CommandStatus::Rejected("not a commit".to_string()),
                CommandStatus::Rejected("funny refname".to_string()),
            ]
        );
    }

    #[test]
    fn commits_with_missing_blobs_do_not_move_refs() {
        let (source, target, tip) = source_and_target();
        let source = repository(&source);
        let database = source.database();
        let objects = reachable_objects(database, std::slice::from_ref(&tip), &HashSet::new()).unwrap();
        let mut writer = PackWriter::new(Vec::new(), 2).unwrap();
        for oid in &objects {
            let (object_type, content) = database.load_raw(oid).unwrap();
            if object_type != ObjectType::Blob {
                writer.write_object(object_type, &content).unwrap();
            }
        }
        let pack = writer.finish().unwrap();
        let body = push_body(&[format!("{} {tip} refs/heads/master", ObjectId::zero())], &pack);

        let target = repository(&target);
        let outcome = receive_pack(&target, &body, LIMIT).unwrap();

        assert!(outcome.unpack_error.is_none());
        assert!(outcome.accepted.is_empty());
        assert_eq!(
            outcome.statuses,
            vec![(
                "refs/heads/master".to_string(),
                CommandStatus::Rejected("missing necessary objects".to_string())
            )]
        );
        assert!(target.refs().list_refs().unwrap().is_empty());
    }

    #[test]
    fn pushes_on_top_of_known_history_only_need_new_objects() {
        let (source_dir, target, first) = source_and_target();
        let source = repository(&source_dir);
        let first_body = push_body(&[format!("{} {first} refs/heads/master", ObjectId::zero())], &pack_from(&source, &first));
        let target = repository(&target);
        assert!(receive_pack(&target, &first_body, LIMIT).unwrap().is_clean());

        let mut backend = Registry::with_defaults(BackendSettings::default())
            .open(GIT_FLAVOR, source_dir.path())
            .unwrap();
        backend.write("b.txt", Bytes::from_static(b"more")).unwrap();
        let second = backend.commit(&CommitArgs::new("second")).unwrap().unwrap();
        let second = second.revision().clone();

        let database = source.database();
        let excluded = reachable_objects(database, std::slice::from_ref(&first), &HashSet::new())
            .unwrap()
            .into_iter()
            .collect::<HashSet<_>>();
        let objects = reachable_objects(database, std::slice::from_ref(&second), &excluded).unwrap();
        let mut writer = PackWriter::new(Vec::new(), objects.len() as u32).unwrap();
        for oid in &objects {
            let (object_type, content) = database.load_raw(oid).unwrap();
            writer.write_object(object_type, &content).unwrap();
        }
        let body = push_body(&[format!("{first} {second} refs/heads/master")], &writer.finish().unwrap());

        let outcome = receive_pack(&target, &body, LIMIT).unwrap();

        assert!(outcome.is_clean());
        assert_eq!(
            target.refs().read_ref(&SymRefName::new("refs/heads/master".to_string())).unwrap(),
            Some(second)
        );
    }
}
