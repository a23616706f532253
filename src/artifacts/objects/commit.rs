//! Commit object
//!
//! Commits tie a tree snapshot to its parents and to the people who wrote and
//! recorded it.
//!
//! ## Format
//!
//! On disk:
//! ```text
//! commit <size>\0
//! tree <tree-sha>
//! parent <parent-sha>
//! author <name> <email> <timestamp> <timezone>
//! committer <name> <email> <timestamp> <timezone>
//! [extra headers, e.g. encoding or gpgsig]
//!
//! <commit message>
//! ```
//!
//! The message is kept verbatim (everything after the first blank line), and
//! extra headers are preserved in order, so a commit received over the wire
//! re-serializes to the same bytes and therefore the same id.

use crate::artifacts::objects::object::Unpackable;
use crate::artifacts::objects::object::{Object, Packable};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use std::io::{BufRead, Write};

/// Author or committer signature
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Author {
    name: String,
    email: String,
    timestamp: DateTime<FixedOffset>,
}

impl Author {
    /// Create a signature stamped with the current local time.
    pub fn new(name: String, email: String) -> Self {
        Author {
            name,
            email,
            timestamp: chrono::Local::now().fixed_offset(),
        }
    }

    pub fn new_with_timestamp(name: String, email: String, timestamp: DateTime<FixedOffset>) -> Self {
        Author {
            name,
            email,
            timestamp,
        }
    }

    /// Build a signature from an identity string such as `Jane <jane@example.com>`,
    /// `Jane` or `<jane@example.com>`.
    pub fn from_identity(identity: &str, timestamp: DateTime<FixedOffset>) -> Self {
        let identity = identity.trim();
        let (name, email) = match (identity.find('<'), identity.rfind('>')) {
            (Some(start), Some(end)) if start < end => (
                identity[..start].trim().to_string(),
                identity[start + 1..end].trim().to_string(),
            ),
            _ => (identity.to_string(), String::new()),
        };

        Author::new_with_timestamp(name, email, timestamp)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// "Name <email@example.com>"
    pub fn display_name(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }

    /// "Name <email> timestamp timezone", as written into commit headers
    pub fn display(&self) -> String {
        format!(
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.timestamp.timestamp(),
            self.timestamp.format("%z")
        )
    }

    pub fn readable_timestamp(&self) -> String {
        self.timestamp
            .format("%a %b %-d %H:%M:%S %Y %z")
            .to_string()
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }
}

impl TryFrom<&str> for Author {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // "name <email> timestamp timezone", split from the right
        let parts: Vec<&str> = value.rsplitn(3, ' ').collect();
        if parts.len() < 3 {
            return Err(anyhow::anyhow!("Invalid author format: {value}"));
        }

        let offset = parse_offset(parts[0])?;
        let timestamp = parts[1]
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("Invalid timestamp: {}", parts[1]))?;
        let name_email_part = parts[2];

        let email_start = name_email_part
            .find('<')
            .ok_or_else(|| anyhow::anyhow!("Invalid author format: missing '<'"))?;
        let email_end = name_email_part
            .rfind('>')
            .ok_or_else(|| anyhow::anyhow!("Invalid author format: missing '>'"))?;
        if email_end < email_start {
            return Err(anyhow::anyhow!("Invalid author format: {value}"));
        }

        let name = name_email_part[..email_start].trim().to_string();
        let email = name_email_part[email_start + 1..email_end].to_string();

        let datetime = DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid timestamp: {timestamp}"))?
            .with_timezone(&offset);

        Ok(Author {
            name,
            email,
            timestamp: datetime,
        })
    }
}

/// Parse a `+hhmm`/`-hhmm` timezone into an offset.
fn parse_offset(timezone: &str) -> anyhow::Result<FixedOffset> {
    let invalid = || anyhow::anyhow!("Invalid timezone: {timezone}");
    if timezone.len() != 5 {
        return Err(invalid());
    }

    let sign = match &timezone[..1] {
        "+" => 1,
        "-" => -1,
        _ => return Err(invalid()),
    };
    let hours = timezone[1..3].parse::<i32>().map_err(|_| invalid())?;
    let minutes = timezone[3..5].parse::<i32>().map_err(|_| invalid())?;

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Commit {
    parents: Vec<ObjectId>,
    tree_oid: ObjectId,
    author: Author,
    committer: Author,
    /// Headers after `committer`, continuation lines joined with '\n'
    extra_headers: Vec<(String, String)>,
    message: String,
}

impl Commit {
    pub fn new(
        parents: Vec<ObjectId>,
        tree_oid: ObjectId,
        author: Author,
        committer: Author,
        message: String,
    ) -> Self {
        Commit {
            parents,
            tree_oid,
            author,
            committer,
            extra_headers: Vec::new(),
            message,
        }
    }

    pub fn short_message(&self) -> String {
        self.message.lines().next().unwrap_or("").to_string()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn tree_oid(&self) -> &ObjectId {
        &self.tree_oid
    }

    pub fn parent(&self) -> Option<&ObjectId> {
        self.parents.first()
    }

    pub fn parents(&self) -> &[ObjectId] {
        &self.parents
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn committer(&self) -> &Author {
        &self.committer
    }

    pub fn extra_header(&self, key: &str) -> Option<&str> {
        self.extra_headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Commit time, the value history ordering and time bounds use.
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.committer.timestamp()
    }

    fn header_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("tree {}", self.tree_oid.as_ref())];
        for parent in &self.parents {
            lines.push(format!("parent {}", parent.as_ref()));
        }
        lines.push(format!("author {}", self.author.display()));
        lines.push(format!("committer {}", self.committer.display()));
        for (key, value) in &self.extra_headers {
            lines.push(format!("{key} {}", value.replace('\n', "\n ")));
        }
        lines
    }
}

impl Packable for Commit {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut content_bytes = Vec::new();
        for line in self.header_lines() {
            content_bytes.write_all(line.as_bytes())?;
            content_bytes.push(b'\n');
        }
        content_bytes.push(b'\n');
        content_bytes.write_all(self.message.as_bytes())?;

        let mut commit_bytes = Vec::new();
        let header = format!("{} {}\0", self.object_type().as_str(), content_bytes.len());
        commit_bytes.write_all(header.as_bytes())?;
        commit_bytes.write_all(&content_bytes)?;

        Ok(Bytes::from(commit_bytes))
    }
}

impl Unpackable for Commit {
    fn deserialize(mut reader: impl BufRead) -> anyhow::Result<Self> {
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        let content = String::from_utf8_lossy(&content);

        let (headers, message) = match content.split_once("\n\n") {
            Some((headers, message)) => (headers, message.to_string()),
            None => (content.trim_end_matches('\n'), String::new()),
        };

        let mut tree_oid = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers: Vec<(String, String)> = Vec::new();

        for line in headers.split('\n') {
            if let Some(continuation) = line.strip_prefix(' ') {
                let (_, value) = extra_headers
                    .last_mut()
                    .context("Invalid commit object: dangling continuation line")?;
                value.push('\n');
                value.push_str(continuation);
                continue;
            }

            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "tree" if tree_oid.is_none() => {
                    tree_oid = Some(ObjectId::try_parse(value.to_string())?);
                }
                "parent" if author.is_none() => {
                    parents.push(ObjectId::try_parse(value.to_string())?);
                }
                "author" if author.is_none() => author = Some(Author::try_from(value)?),
                "committer" if committer.is_none() => {
                    committer = Some(Author::try_from(value)?)
                }
                _ => extra_headers.push((key.to_string(), value.to_string())),
            }
        }

        let author = author.context("Invalid commit object: missing author line")?;
        Ok(Commit {
            parents,
            tree_oid: tree_oid.context("Invalid commit object: missing tree line")?,
            committer: committer.unwrap_or_else(|| author.clone()),
            author,
            extra_headers,
            message,
        })
    }
}

impl Object for Commit {
    fn object_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn display(&self) -> String {
        let mut lines = self.header_lines();
        lines.push(String::new());
        lines.push(self.message.to_string());

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn parse(raw: &str) -> Commit {
        Commit::deserialize(Cursor::new(raw.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn signature_keeps_its_offset() {
        let author = Author::try_from("Jane Doe <jane@example.com> 1700000000 -0130").unwrap();

        assert_eq!(author.name(), "Jane Doe");
        assert_eq!(author.email(), "jane@example.com");
        assert_eq!(author.timestamp().timestamp(), 1700000000);
        assert_eq!(author.timestamp().offset().local_minus_utc(), -(90 * 60));
        assert_eq!(author.display(), "Jane Doe <jane@example.com> 1700000000 -0130");
    }

    #[test]
    fn identity_strings_split_into_name_and_email() {
        let now = chrono::Local::now().fixed_offset();

        let full = Author::from_identity("Jane <jane@example.com>", now);
        assert_eq!((full.name(), full.email()), ("Jane", "jane@example.com"));

        let email_only = Author::from_identity("<ops@example.com>", now);
        assert_eq!((email_only.name(), email_only.email()), ("", "ops@example.com"));

        let name_only = Author::from_identity("robot", now);
        assert_eq!((name_only.name(), name_only.email()), ("robot", ""));
    }

    #[test]
    fn committer_and_extra_headers_survive_a_round_trip() {
        let raw = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                   author A <a@x> 1700000000 +0000\n\
                   committer C <c@x> 1700000100 +0200\n\
                   encoding ISO-8859-1\n\
                   gpgsig -----BEGIN-----\n \n abc\n -----END-----\n\
                   \n\
                   subject\n\nbody without trailing newline";
        let commit = parse(raw);

        assert_eq!(commit.committer().name(), "C");
        assert_eq!(commit.timestamp().timestamp(), 1700000100);
        assert_eq!(commit.extra_header("encoding"), Some("ISO-8859-1"));
        assert_eq!(commit.message(), "subject\n\nbody without trailing newline");

        let serialized = commit.serialize().unwrap();
        let expected = format!("commit {}\0{raw}", raw.len());
        assert_eq!(serialized.as_ref(), expected.as_bytes());
    }

    #[test]
    fn parents_are_kept_in_order() {
        let raw = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                   parent 1111111111111111111111111111111111111111\n\
                   parent 2222222222222222222222222222222222222222\n\
                   author A <a@x> 1 +0000\n\
                   committer A <a@x> 1 +0000\n\
                   \n\
                   merge\n";
        let commit = parse(raw);

        assert_eq!(commit.parents().len(), 2);
        assert_eq!(commit.parent().unwrap().as_ref(), "1".repeat(40));
    }
}
