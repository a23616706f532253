use pretty_assertions::assert_eq;
use rstest::rstest;
use vellum::errors::BackendError;

mod common;
use common::{TestRepository, empty_repository, populated_repository};

#[rstest]
fn branches_start_at_the_default_tip_or_a_revision(
    populated_repository: TestRepository,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = &populated_repository.backend;
    backend.create_branch("drafts", None)?;
    backend.create_branch("review/2024", Some("master~2"))?;

    assert!(backend.has_branch("drafts")?);
    assert!(!backend.has_branch("published")?);
    assert_eq!(backend.list_branches()?, ["drafts", "master", "review/2024"]);
    assert_eq!(backend.revision(None, Some("drafts"))?, backend.revision(None, None)?);
    assert_eq!(backend.revision(None, Some("review/2024"))?.message(), "Initial commit");
    Ok(())
}

#[rstest]
fn creating_an_existing_branch_fails(
    populated_repository: TestRepository,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = &populated_repository.backend;
    backend.create_branch("drafts", Some("master~2"))?;

    let error = backend.create_branch("drafts", None).unwrap_err();

    assert!(matches!(error, BackendError::BranchAlreadyExists { .. }), "{error}");
    assert_eq!(backend.revision(None, Some("drafts"))?.message(), "Initial commit");
    Ok(())
}

#[rstest]
fn deleting_a_missing_branch_fails(populated_repository: TestRepository) {
    let error = populated_repository.backend.delete_branch("drafts").unwrap_err();

    assert!(error.is_branch_does_not_exist());
}

#[rstest]
fn renamed_branches_keep_their_tip(
    populated_repository: TestRepository,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = &populated_repository.backend;
    backend.create_branch("drafts", Some("master^"))?;
    let tip = backend.revision(None, Some("drafts"))?;

    backend.rename_branch("drafts", "archive/drafts")?;

    assert!(!backend.has_branch("drafts")?);
    assert_eq!(backend.revision(None, Some("archive/drafts"))?, tip);
    assert!(backend.rename_branch("drafts", "again").unwrap_err().is_branch_does_not_exist());
    assert!(matches!(
        backend.rename_branch("archive/drafts", "master").unwrap_err(),
        BackendError::BranchAlreadyExists { .. }
    ));
    assert!(backend.has_branch("archive/drafts")?);
    Ok(())
}

#[rstest]
#[case("-leading-dash.lock")]
#[case("double..dot")]
#[case("with space")]
#[case("trailing/")]
fn invalid_branch_names_are_rejected(populated_repository: TestRepository, #[case] name: &str) {
    let error = populated_repository.backend.create_branch(name, None).unwrap_err();

    assert!(matches!(error, BackendError::InvalidBranchName { .. }), "{error}");
}

#[rstest]
fn empty_repositories_have_nothing_to_branch_from(empty_repository: TestRepository) {
    let backend = &empty_repository.backend;

    assert!(backend.list_branches().unwrap().is_empty());
    assert!(!backend.has_branch("master").unwrap());
    assert!(backend.create_branch("drafts", None).unwrap_err().is_branch_does_not_exist());
}
