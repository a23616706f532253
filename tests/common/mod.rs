#![allow(dead_code)]

use assert_fs::TempDir;
use bytes::Bytes;
use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use rstest::fixture;
use std::sync::Arc;
use vellum::backend::registry::{BackendSettings, GIT_FLAVOR, Registry};
use vellum::backend::revision::RevisionHandle;
use vellum::backend::{Backend, CommitArgs};
use vellum::config::{Encoding, Identity};

pub const AUTHOR: &str = "Test Author <author@example.com>";

/// A backend together with the temporary directory holding its repository
pub struct TestRepository {
    pub dir: TempDir,
    pub registry: Arc<Registry>,
    pub backend: Box<dyn Backend>,
}

impl TestRepository {
    /// Stage `files` and commit them at `minute` past the base time.
    pub fn commit(&mut self, files: &[(&str, &str)], message: &str, minute: i64) -> RevisionHandle {
        for (path, content) in files {
            self.backend
                .write(path, Bytes::from(content.to_string()))
                .expect("failed to stage file");
        }
        self.backend
            .commit(&CommitArgs::new(message).at(at(minute)))
            .expect("failed to commit")
            .expect("nothing was committed")
    }

    pub fn read(&self, path: &str) -> String {
        self.backend
            .read_text(path, None, None, None)
            .expect("failed to read file")
    }

    pub fn messages(&self, revisions: &[RevisionHandle]) -> Vec<String> {
        revisions
            .iter()
            .map(|revision| revision.message().trim_end().to_string())
            .collect()
    }
}

/// 2024-01-01 12:00 at UTC+2, shifted by `minute` minutes.
pub fn at(minute: i64) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(2 * 3600).expect("valid offset");
    offset
        .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::minutes(minute)
}

#[fixture]
pub fn settings() -> BackendSettings {
    BackendSettings {
        identity: Identity::new(
            Some("Test Author".to_string()),
            Some("author@example.com".to_string()),
        ),
        default_branch: "master".to_string(),
        default_encoding: Encoding::Utf8,
    }
}

#[fixture]
pub fn registry(settings: BackendSettings) -> Arc<Registry> {
    Arc::new(Registry::with_defaults(settings))
}

#[fixture]
pub fn repository_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

#[fixture]
pub fn empty_repository(repository_dir: TempDir, registry: Arc<Registry>) -> TestRepository {
    let backend = registry
        .open(GIT_FLAVOR, repository_dir.path())
        .expect("failed to open backend");
    backend.init_repo().expect("failed to init repository");

    TestRepository {
        dir: repository_dir,
        registry,
        backend,
    }
}

/// Three commits on `master`:
///
/// 1. `1.txt`, `a/2.txt`, `a/b/3.txt`
/// 2. `a/2.txt` modified
/// 3. `c/4.txt` added
#[fixture]
pub fn populated_repository(mut empty_repository: TestRepository) -> TestRepository {
    empty_repository.commit(
        &[("1.txt", "one\n"), ("a/2.txt", "two\n"), ("a/b/3.txt", "three\n")],
        "Initial commit",
        0,
    );
    empty_repository.commit(&[("a/2.txt", "two\nand a half\n")], "Extend two", 10);
    empty_repository.commit(&[("c/4.txt", "four\n")], "Add four", 20);
    empty_repository
}
