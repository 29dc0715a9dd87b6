//! Assembly registry - the set of local artifacts that may be updated
//!
//! Layout relative to the installation root:
//! - executables: `<name><EXE_SUFFIX>`
//! - dependencies: `<name>.<DLL_EXTENSION>`
//! - plugins: `plugins/<name>.<DLL_EXTENSION>`
//!
//! Identity is the name alone. The same plugin can be reached through several
//! configuration paths and must only be tracked once.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env::consts::{DLL_EXTENSION, EXE_SUFFIX};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Subdirectory holding plugins
pub const PLUGINS_DIR: &str = "plugins";

/// Kind of artifact, which determines where it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyKind {
    Executable,
    Dependency,
    Plugin,
}

impl AssemblyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyKind::Executable => "executable",
            AssemblyKind::Dependency => "dependency",
            AssemblyKind::Plugin => "plugin",
        }
    }

    /// Relative path of an artifact of this kind
    pub fn relative_path(&self, name: &str) -> PathBuf {
        match self {
            AssemblyKind::Executable => PathBuf::from(format!("{}{}", name, EXE_SUFFIX)),
            AssemblyKind::Dependency => PathBuf::from(format!("{}.{}", name, DLL_EXTENSION)),
            AssemblyKind::Plugin => {
                Path::new(PLUGINS_DIR).join(format!("{}.{}", name, DLL_EXTENSION))
            }
        }
    }
}

/// A trackable local artifact
#[derive(Debug, Clone)]
pub struct Assembly {
    name: String,
    kind: AssemblyKind,
    path: PathBuf,
}

impl Assembly {
    pub fn new(name: impl Into<String>, kind: AssemblyKind) -> Self {
        let name = name.into();
        let path = kind.relative_path(&name);
        Self { name, kind, path }
    }

    pub fn executable(name: impl Into<String>) -> Self {
        Self::new(name, AssemblyKind::Executable)
    }

    pub fn dependency(name: impl Into<String>) -> Self {
        Self::new(name, AssemblyKind::Dependency)
    }

    pub fn plugin(name: impl Into<String>) -> Self {
        Self::new(name, AssemblyKind::Plugin)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AssemblyKind {
        self.kind
    }

    /// Path relative to the installation root
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path under an installation root
    pub fn local_path(&self, install_root: &Path) -> PathBuf {
        install_root.join(&self.path)
    }

    /// Directory that receives this assembly's release assets
    pub fn target_dir(&self, install_root: &Path) -> PathBuf {
        match self.path.parent() {
            Some(parent) => install_root.join(parent),
            None => install_root.to_path_buf(),
        }
    }
}

impl PartialEq for Assembly {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Assembly {}

impl Hash for Assembly {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Immutable, name-deduplicated set of assemblies in discovery order
#[derive(Debug, Clone, Default)]
pub struct AssemblyRegistry {
    assemblies: Vec<Assembly>,
}

impl AssemblyRegistry {
    /// Union of defaults and configuration-derived entries.
    /// The first occurrence of a name wins.
    pub fn build<I, J>(defaults: I, discovered: J) -> Self
    where
        I: IntoIterator<Item = Assembly>,
        J: IntoIterator<Item = Assembly>,
    {
        let mut seen = HashSet::new();
        let assemblies = defaults
            .into_iter()
            .chain(discovered)
            .filter(|a| !a.name.is_empty() && seen.insert(a.name.clone()))
            .collect();

        Self { assemblies }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Assembly> {
        self.assemblies.iter()
    }

    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.assemblies.iter().any(|a| a.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Assembly> {
        self.assemblies.iter().find(|a| a.name == name)
    }
}

impl<'a> IntoIterator for &'a AssemblyRegistry {
    type Item = &'a Assembly;
    type IntoIter = std::slice::Iter<'a, Assembly>;

    fn into_iter(self) -> Self::IntoIter {
        self.assemblies.iter()
    }
}
