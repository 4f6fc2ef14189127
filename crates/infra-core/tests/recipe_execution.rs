//! Recipe execution against the in-memory image model.

use infra_core::fakes::{InMemoryImage, Operation};
use infra_core::recipe::InstallMode;
use infra_core::{BuildSpec, CompilerKind, InfraError, Recipe, RecipeOptions};

fn recipe(kind: CompilerKind, version: &str) -> Recipe {
    Recipe::for_spec(
        &BuildSpec::new(kind, version, &["latest"]),
        &RecipeOptions::default(),
    )
}

/// Test: a gcc recipe installs the compiler, selects it and cleans caches
#[test]
fn test_gcc_recipe_on_fresh_image() {
    let mut image = InMemoryImage::fresh();
    recipe(CompilerKind::Gcc, "14")
        .execute(&mut image)
        .expect("recipe failed");

    assert!(image.is_installed("=sys-devel/gcc-14*"));
    assert!(image.is_installed("dev-build/cmake"));
    assert_eq!(
        image.default_compiler(),
        Some(&(CompilerKind::Gcc, "14".to_string()))
    );
    assert_eq!(image.cache_entries(), 0, "caches should be removed");
}

/// Test: the masked compiler is unmasked by the autounmask protocol
#[test]
fn test_autounmask_first_failure_is_tolerated() {
    let mut image = InMemoryImage::fresh()
        .with_masked(&["=llvm-core/clang-20*", "=llvm-core/lld-20*"]);

    recipe(CompilerKind::Clang, "20")
        .execute(&mut image)
        .expect("autounmask should recover");

    let installs: Vec<(InstallMode, bool)> = image
        .log()
        .iter()
        .filter_map(|op| match op {
            Operation::Install { mode, ok, atoms } if atoms[0].contains("clang") => {
                Some((*mode, *ok))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        installs,
        vec![(InstallMode::AutounmaskWrite, false), (InstallMode::Normal, true)]
    );

    let write = image
        .log()
        .iter()
        .position(|op| matches!(op, Operation::Install { mode: InstallMode::AutounmaskWrite, .. }))
        .unwrap();
    assert_eq!(image.log()[write + 1], Operation::Reconcile);
    assert!(image.is_installed("=llvm-core/lld-20*"));
}

/// Test: a failing second attempt aborts the recipe
#[test]
fn test_autounmask_second_failure_is_fatal() {
    let mut image = InMemoryImage::fresh().fail_install("=sys-devel/gcc-13*", 2);

    let err = recipe(CompilerKind::Gcc, "13")
        .execute(&mut image)
        .unwrap_err();

    match err {
        InfraError::PackageInstall { step, .. } => assert!(step.contains("sys-devel/gcc-13")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(image.default_compiler().is_none());
    assert!(!image.log().contains(&Operation::CleanCaches));
}

/// Test: plain installs are not retried
#[test]
fn test_auxiliary_install_failure_is_not_retried() {
    let mut image = InMemoryImage::fresh().fail_install("dev-vcs/git", 1);

    let err = recipe(CompilerKind::Gcc, "14")
        .execute(&mut image)
        .unwrap_err();
    assert!(matches!(err, InfraError::PackageInstall { .. }));

    let git_attempts = image
        .log()
        .iter()
        .filter(|op| matches!(op, Operation::Install { atoms, .. } if atoms.contains(&"dev-vcs/git".to_string())))
        .count();
    assert_eq!(git_attempts, 1);
}

/// Test: the p2996 fork is only installable after its repository is added
#[test]
fn test_p2996_repository_registered_before_install() {
    let mut image = InMemoryImage::fresh();
    recipe(CompilerKind::ClangP2996, "trunk")
        .execute(&mut image)
        .expect("recipe failed");

    let add = image
        .log()
        .iter()
        .position(|op| matches!(op, Operation::AddRepository(_)))
        .unwrap();
    let first_install = image
        .log()
        .iter()
        .position(|op| matches!(op, Operation::Install { .. }))
        .unwrap();
    assert!(add < first_install);
    assert!(image.is_installed("=llvm-core/clang-p2996-9999*::clang-p2996"));
}

/// Test: running a recipe twice yields the same toolchain
#[test]
fn test_recipe_is_idempotent() {
    for kind in CompilerKind::ALL {
        let r = recipe(kind, "19");

        let mut once = InMemoryImage::fresh();
        r.execute(&mut once).unwrap();

        let mut twice = InMemoryImage::fresh();
        r.execute(&mut twice).unwrap();
        r.execute(&mut twice).unwrap();

        assert_eq!(once.installed(), twice.installed());
        assert_eq!(once.default_compiler(), twice.default_compiler());
    }
}
