use crate::areas::repository::Repository;
use crate::artifacts::branch::branch_name::{BranchName, SymRefName};
use crate::artifacts::branch::{ANCESTOR_REGEX, NULL_REVISION, PARENT_REGEX, REF_ALIASES};
use crate::artifacts::objects::OBJECT_ID_LENGTH;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use anyhow::Context;

/// Minimum length of an abbreviated object id
const MIN_PREFIX_LENGTH: usize = 4;

/// A revision expression naming a commit.
///
/// The base of an expression resolves, in order, as:
/// - the null sentinel, which never resolves
/// - a full 40-hex object id (must name a commit)
/// - `HEAD` (or its alias `@`) and `refs/...` paths
/// - an unambiguous abbreviated object id of at least 4 hex digits
/// - a branch name under `refs/heads/`
///
/// `<rev>^` selects the first parent and `<rev>~<n>` the n-th first-parent
/// ancestor.
#[derive(Debug, Clone)]
pub enum Revision {
    Null,
    Ref(BranchName),
    Ancestor(Box<Revision>, usize),
    Parent(Box<Revision>),
}

impl Revision {
    /// Resolve to a commit id; `None` when nothing (or nothing unambiguous) matches.
    pub fn resolve(&self, repository: &Repository) -> anyhow::Result<Option<ObjectId>> {
        match self {
            Revision::Null => Ok(None),
            Revision::Ref(name) => Self::resolve_name(name.as_ref(), repository),
            Revision::Parent(base_revision) => {
                Self::resolve_commit_parent(base_revision.resolve(repository)?, repository)
            }
            Revision::Ancestor(base_revision, generations) => {
                let mut oid = base_revision.resolve(repository)?;
                for _ in 0..*generations {
                    oid = Self::resolve_commit_parent(oid, repository)?;
                }

                Ok(oid)
            }
        }
    }

    fn resolve_name(name: &str, repository: &Repository) -> anyhow::Result<Option<ObjectId>> {
        if name.len() == OBJECT_ID_LENGTH && Self::is_hex(name) {
            let oid = ObjectId::try_parse(name.to_string())?;
            return Self::commit_or_none(oid, repository);
        }

        if name == "HEAD" {
            return match repository.refs().read_head()? {
                Some(oid) => Self::commit_or_none(oid, repository),
                None => Ok(None),
            };
        }

        if name.starts_with("refs/") {
            return match repository.refs().read_ref(&SymRefName::new(name.to_string()))? {
                Some(oid) => Self::commit_or_none(oid, repository),
                None => Ok(None),
            };
        }

        if Self::looks_like_oid(name)
            && let Some(oid) = Self::resolve_prefix(name, repository)?
        {
            return Ok(Some(oid));
        }

        let branch_name = BranchName::try_parse(name.to_string())?;
        match repository.refs().read_branch(&branch_name)? {
            Some(oid) => Self::commit_or_none(oid, repository),
            None => Ok(None),
        }
    }

    fn resolve_commit_parent(
        oid: Option<ObjectId>,
        repository: &Repository,
    ) -> anyhow::Result<Option<ObjectId>> {
        if let Some(oid) = oid {
            let commit = repository
                .database()
                .parse_object_as_commit(&oid)?
                .ok_or_else(|| anyhow::anyhow!("object {} is not a commit", oid))?;

            Ok(commit.parent().cloned())
        } else {
            Ok(None)
        }
    }

    /// Unique commit whose id starts with `prefix`.
    fn resolve_prefix(prefix: &str, repository: &Repository) -> anyhow::Result<Option<ObjectId>> {
        let commit_matches = repository
            .database()
            .find_objects_by_prefix(prefix)?
            .into_iter()
            .filter(|oid| {
                repository
                    .database()
                    .get_object_type(oid)
                    .map(|object_type| object_type == ObjectType::Commit)
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();

        match commit_matches.as_slice() {
            [oid] => Ok(Some(oid.clone())),
            [] => Ok(None),
            candidates => {
                tracing::debug!(
                    prefix,
                    candidates = candidates.len(),
                    "abbreviated revision is ambiguous"
                );
                Ok(None)
            }
        }
    }

    fn commit_or_none(oid: ObjectId, repository: &Repository) -> anyhow::Result<Option<ObjectId>> {
        if !repository.database().exists(&oid) {
            return Ok(None);
        }

        let object_type = repository
            .database()
            .get_object_type(&oid)
            .with_context(|| format!("object {} not readable", oid))?;

        Ok((object_type == ObjectType::Commit).then_some(oid))
    }

    pub fn try_parse(revision: &str) -> anyhow::Result<Revision> {
        if revision == NULL_REVISION {
            return Ok(Revision::Null);
        }

        let parent_regex = regex::Regex::new(PARENT_REGEX)
            .with_context(|| format!("invalid parent regex: {PARENT_REGEX}"))?;
        let ancestor_regex = regex::Regex::new(ANCESTOR_REGEX)
            .with_context(|| format!("invalid ancestor regex: {ANCESTOR_REGEX}"))?;

        if let Some(caps) = parent_regex.captures(revision) {
            let base_revision = Self::try_parse(&caps[1])?;

            Ok(Revision::Parent(Box::new(base_revision)))
        } else if let Some(caps) = ancestor_regex.captures(revision) {
            let generations: usize = caps[2]
                .parse()
                .with_context(|| format!("failed to parse generations in revision: {revision}"))?;
            let base_revision = Self::try_parse(&caps[1])?;

            Ok(Revision::Ancestor(Box::new(base_revision), generations))
        } else {
            let resolved_name = *REF_ALIASES.get(revision).unwrap_or(&revision);
            let branch_name = BranchName::try_parse(resolved_name.to_string())?;
            Ok(Revision::Ref(branch_name))
        }
    }

    fn is_hex(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_hexdigit())
    }

    fn looks_like_oid(s: &str) -> bool {
        s.len() >= MIN_PREFIX_LENGTH && s.len() < OBJECT_ID_LENGTH && Self::is_hex(s)
    }
}
