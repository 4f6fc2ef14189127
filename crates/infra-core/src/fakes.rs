//! In-memory package backend (testing only)
//!
//! [`InMemoryImage`] models a fresh base image: masked packages refuse to
//! install until an autounmask attempt has written an unmask entry and the
//! configuration has been reconciled, and atoms pinned to a repository
//! (`::name`) need that repository to be registered first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::recipe::{BackendError, BackendResult, InstallMode, PackageBackend};
use crate::spec::CompilerKind;

/// Operation log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Sync,
    AddRepository(String),
    Install { atoms: Vec<String>, mode: InstallMode, ok: bool },
    Reconcile,
    SelectDefault(CompilerKind, String),
    CleanCaches,
}

/// Model of a base image under construction.
#[derive(Debug, Default)]
pub struct InMemoryImage {
    repositories: BTreeSet<String>,
    masked: BTreeSet<String>,
    pending_unmask: BTreeSet<String>,
    installed: BTreeMap<String, usize>,
    default_compiler: Option<(CompilerKind, String)>,
    cache_entries: usize,
    forced_failures: HashMap<String, usize>,
    log: Vec<Operation>,
}

impl InMemoryImage {
    /// A fresh image with nothing masked.
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Mark atoms as masked in the base image.
    pub fn with_masked(mut self, atoms: &[&str]) -> Self {
        self.masked.extend(atoms.iter().map(|a| a.to_string()));
        self
    }

    /// Make the next `times` installs containing `atom` fail.
    pub fn fail_install(mut self, atom: &str, times: usize) -> Self {
        self.forced_failures.insert(atom.to_string(), times);
        self
    }

    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn is_installed(&self, atom: &str) -> bool {
        self.installed.contains_key(atom)
    }

    /// Installed atoms, sorted.
    pub fn installed(&self) -> Vec<String> {
        self.installed.keys().cloned().collect()
    }

    pub fn default_compiler(&self) -> Option<&(CompilerKind, String)> {
        self.default_compiler.as_ref()
    }

    pub fn cache_entries(&self) -> usize {
        self.cache_entries
    }

    fn check_atom(&mut self, atom: &str, mode: InstallMode) -> BackendResult {
        if let Some(remaining) = self.forced_failures.get_mut(atom) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError(format!("emerge failed for {}", atom)));
            }
        }
        if let Some((_, repo)) = atom.split_once("::") {
            if !self.repositories.contains(repo) {
                return Err(BackendError(format!("repository '{}' not found", repo)));
            }
        }
        if self.masked.contains(atom) {
            if mode == InstallMode::AutounmaskWrite {
                self.pending_unmask.insert(atom.to_string());
            }
            return Err(BackendError(format!("{} is masked", atom)));
        }
        Ok(())
    }
}

impl PackageBackend for InMemoryImage {
    fn sync(&mut self) -> BackendResult {
        self.log.push(Operation::Sync);
        self.cache_entries += 1;
        Ok(())
    }

    fn add_repository(&mut self, name: &str, _uri: &str) -> BackendResult {
        self.log.push(Operation::AddRepository(name.to_string()));
        self.repositories.insert(name.to_string());
        Ok(())
    }

    fn install(&mut self, atoms: &[String], mode: InstallMode) -> BackendResult {
        // every atom is checked so an autounmask attempt records all of them
        let mut outcome: BackendResult = Ok(());
        for atom in atoms {
            if let Err(e) = self.check_atom(atom, mode) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        self.log.push(Operation::Install {
            atoms: atoms.to_vec(),
            mode,
            ok: outcome.is_ok(),
        });
        outcome?;

        for atom in atoms {
            // --noreplace: already installed atoms are left alone
            if !self.installed.contains_key(atom) {
                let order = self.installed.len();
                self.installed.insert(atom.clone(), order);
                self.cache_entries += 1;
            }
        }
        Ok(())
    }

    fn reconcile_config(&mut self) -> BackendResult {
        self.log.push(Operation::Reconcile);
        for atom in std::mem::take(&mut self.pending_unmask) {
            self.masked.remove(&atom);
        }
        Ok(())
    }

    fn select_default(&mut self, kind: CompilerKind, version: &str) -> BackendResult {
        self.log
            .push(Operation::SelectDefault(kind, version.to_string()));
        if self.installed.is_empty() {
            return Err(BackendError("no compiler installed".to_string()));
        }
        self.default_compiler = Some((kind, version.to_string()));
        Ok(())
    }

    fn clean_caches(&mut self) -> BackendResult {
        self.log.push(Operation::CleanCaches);
        self.cache_entries = 0;
        Ok(())
    }
}
