//! Fetch negotiation over stateless RPC
//!
//! Each request carries every `want`, the `have`s of the current round and,
//! in the last round, `done`. Without multi-ack the server answers with a
//! single `ACK <oid>` for the first common commit or `NAK`, and sends the pack
//! once the client said `done`.

use crate::areas::database::Database;
use crate::areas::repository::Repository;
use crate::artifacts::objects::entry_mode::EntryMode;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::pack::PackWriter;
use crate::protocol::pkt_line::{BAND_DATA, PktLine, PktLineReader, PktLineWriter};
use anyhow::Context;
use std::collections::HashSet;
use std::io::Cursor;

/// A parsed upload-pack request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub wants: Vec<ObjectId>,
    pub haves: Vec<ObjectId>,
    pub capabilities: HashSet<String>,
    pub done: bool,
}

impl UploadRequest {
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = PktLineReader::new(Cursor::new(body));
        let mut request = UploadRequest::default();

        while let Some(packet) = reader.read()? {
            let PktLine::Data(_) = &packet else {
                continue;
            };
            let line = packet
                .as_text()
                .ok_or_else(|| ProtocolError::Framing("non-utf-8 request line".to_string()))?;

            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "want" => {
                    let mut words = rest.split(' ');
                    let oid = words.next().unwrap_or_default();
                    request.wants.push(parse_oid(oid)?);
                    if request.wants.len() == 1 {
                        request.capabilities.extend(words.map(str::to_string));
                    }
                }
                "have" => request.haves.push(parse_oid(rest)?),
                "done" => request.done = true,
                "shallow" | "deepen" | "deepen-since" | "deepen-not" | "filter" => {
                    return Err(ProtocolError::Unsupported(format!("{command} requests")));
                }
                _ => return Err(ProtocolError::Framing(format!("unexpected line '{line}'"))),
            }
        }

        Ok(request)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

fn parse_oid(oid: &str) -> ProtocolResult<ObjectId> {
    ObjectId::try_parse(oid.to_string())
        .map_err(|_| ProtocolError::Framing(format!("invalid object id '{oid}'")))
}

/// Answer one upload-pack request.
#[tracing::instrument(name = "upload_pack", skip_all, fields(backend = %repository.id()))]
pub fn upload_pack(repository: &Repository, body: &[u8]) -> ProtocolResult<Vec<u8>> {
    let request = UploadRequest::parse(body)?;
    let database = repository.database();

    if let Some(missing) = request.wants.iter().find(|oid| !database.exists(oid)) {
        return Err(ProtocolError::Unsupported(format!("want {missing} is not ours")));
    }

    let common = request
        .haves
        .iter()
        .filter(|oid| database.exists(oid))
        .cloned()
        .collect::<Vec<_>>();

    let mut writer = PktLineWriter::new(Vec::new());
    match common.first() {
        Some(oid) => writer.write_line(&format!("ACK {oid}"))?,
        None => writer.write_line("NAK")?,
    }

    if !request.done || request.wants.is_empty() {
        tracing::debug!(haves = request.haves.len(), common = common.len(), "negotiation round");
        return Ok(writer.into_inner());
    }

    let excluded = reachable_objects(database, &common, &HashSet::new())?
        .into_iter()
        .collect::<HashSet<_>>();
    let objects = reachable_objects(database, &request.wants, &excluded)?;

    let mut pack = PackWriter::new(Vec::new(), objects.len() as u32)?;
    for oid in &objects {
        let (object_type, content) = database.load_raw(oid)?;
        pack.write_object(object_type, &content)?;
    }
    let pack = pack.finish()?;

    tracing::info!(
        wants = request.wants.len(),
        common = common.len(),
        objects = objects.len(),
        bytes = pack.len(),
        "sending pack"
    );

    if request.has_capability("side-band-64k") {
        writer.write_band(BAND_DATA, &pack)?;
        writer.flush_pkt()?;
    } else {
        writer.get_mut().extend_from_slice(&pack);
    }

    Ok(writer.into_inner())
}

/// Every object reachable from `roots` without passing through `excluded`.
pub fn reachable_objects(
    database: &Database,
    roots: &[ObjectId],
    excluded: &HashSet<ObjectId>,
) -> anyhow::Result<Vec<ObjectId>> {
    let mut pending = roots.to_vec();
    let mut visited = HashSet::new();
    let mut objects = Vec::new();

    while let Some(oid) = pending.pop() {
        if excluded.contains(&oid) || !visited.insert(oid.clone()) {
            continue;
        }

        let (object_type, content) = database.load_raw(&oid)?;
        match object_type {
            ObjectType::Commit => {
                let commit = database.load_commit(&oid)?;
                pending.push(commit.tree_oid().clone());
                pending.extend(commit.parents().iter().cloned());
            }
            ObjectType::Tree => {
                let tree = database.load_tree(&oid)?;
                // gitlinks point into other repositories
                pending.extend(
                    tree.entries()
                        .filter(|(_, entry)| entry.mode != EntryMode::Gitlink)
                        .map(|(_, entry)| entry.oid.clone()),
                );
            }
            ObjectType::Tag => {
                let target = std::str::from_utf8(&content)
                    .ok()
                    .and_then(|text| text.lines().next())
                    .and_then(|line| line.strip_prefix("object "))
                    .with_context(|| format!("tag {oid} has no target"))?;
                pending.push(ObjectId::try_parse(target.to_string())?);
            }
            ObjectType::Blob => {}
        }

        objects.push(oid);
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::{BackendSettings, GIT_FLAVOR, Registry};
    use crate::backend::{Backend, CommitArgs};
    use crate::errors::BackendId;
    use crate::protocol::pack::read_pack;
    use assert_fs::TempDir;
    use bytes::Bytes;

    fn request(lines: &[&str]) -> Vec<u8> {
        let mut writer = PktLineWriter::new(Vec::new());
        for line in lines {
            if line.is_empty() {
                writer.flush_pkt().unwrap();
            } else {
                writer.write_line(line).unwrap();
            }
        }
        writer.into_inner()
    }

    fn two_commits(dir: &TempDir) -> (ObjectId, ObjectId) {
        let mut backend = Registry::with_defaults(BackendSettings::default())
            .open(GIT_FLAVOR, dir.path())
            .unwrap();
        backend.init_repo().unwrap();

        backend.write("a.txt", Bytes::from_static(b"1")).unwrap();
        let first = backend.commit(&CommitArgs::new("first")).unwrap().unwrap();
        backend.write("b/c.txt", Bytes::from_static(b"2")).unwrap();
        let second = backend.commit(&CommitArgs::new("second")).unwrap().unwrap();

        (first.revision().clone(), second.revision().clone())
    }

    fn repository(dir: &TempDir) -> Repository {
        let id = BackendId::new(GIT_FLAVOR.to_string(), dir.path().to_path_buf());
        let branch = Repository::parse_default_branch(&id, "master").unwrap();
        Repository::open(id, branch)
    }

    #[test]
    fn requests_are_parsed_with_first_line_capabilities() {
        let oid = "ce013625030ba8dba906f756967f9e9ca394464a";
        let body = request(&[&format!("want {oid} side-band-64k ofs-delta"), "", &format!("have {oid}"), "done"]);

        let parsed = UploadRequest::parse(&body).unwrap();

        assert_eq!(parsed.wants.len(), 1);
        assert_eq!(parsed.haves.len(), 1);
        assert!(parsed.done);
        assert!(parsed.has_capability("side-band-64k"));
    }

    #[test]
    fn clones_receive_every_reachable_object() {
        let dir = TempDir::new().unwrap();
        let (_, second) = two_commits(&dir);
        let repository = repository(&dir);

        let body = request(&[&format!("want {second}"), "", "done"]);
        let response = upload_pack(&repository, &body).unwrap();

        assert!(response.starts_with(b"0008NAK\n"));
        let target = TempDir::new().unwrap();
        let target_db = Database::new(target.path().join("objects").into_boxed_path());
        let objects = read_pack(&response[8..], &target_db, 1024 * 1024).unwrap();
        // 2 commits, 3 trees (two roots and `b`), 2 blobs
        assert_eq!(objects.len(), 7);
        assert!(objects.iter().any(|object| object.oid == second));
    }

    #[test]
    fn common_history_is_not_resent() {
        let dir = TempDir::new().unwrap();
        let (first, second) = two_commits(&dir);
        let repository = repository(&dir);

        let body = request(&[&format!("want {second} side-band-64k"), "", &format!("have {first}"), "done"]);
        let response = upload_pack(&repository, &body).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(response));
        assert_eq!(reader.read().unwrap().unwrap().as_text(), Some(format!("ACK {first}").as_str()));
        let mut pack = Vec::new();
        for packet in reader.read_section().unwrap() {
            assert_eq!(packet[0], BAND_DATA);
            pack.extend_from_slice(&packet[1..]);
        }

        let target = TempDir::new().unwrap();
        let target_db = Database::new(target.path().join("objects").into_boxed_path());
        let objects = read_pack(&pack, &target_db, 1024 * 1024).unwrap();
        // the new commit, its root tree, `b` and `b/c.txt`
        assert_eq!(objects.len(), 4);
    }

    #[test]
    fn rounds_without_done_only_acknowledge() {
        let dir = TempDir::new().unwrap();
        let (first, second) = two_commits(&dir);
        let repository = repository(&dir);

        let body = request(&[&format!("want {second}"), "", &format!("have {first}"), ""]);
        let response = upload_pack(&repository, &body).unwrap();

        assert_eq!(response, format!("0031ACK {first}\n").into_bytes());
    }
}
