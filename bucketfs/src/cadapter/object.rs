use std::fmt;
use std::time::SystemTime;

/// Directory placeholder objects end with this character.
pub const DIR_SUFFIX: char = '/';

/// Object generation. Each write of a name yields a new, larger value.
/// `Generation(0)` is never assigned and is used as the "must not exist"
/// precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub const ABSENT: Generation = Generation(0);
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Regular,
    Directory,
    Symlink,
}

/// Metadata of one remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub name: String,
    pub generation: Generation,
    pub size: u64,
    pub updated: SystemTime,
    pub kind: ObjectKind,
    pub symlink_target: Option<String>,
}

impl ObjectRecord {
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }
}

pub fn is_dir_name(name: &str) -> bool {
    name.ends_with(DIR_SUFFIX)
}

pub fn kind_for(name: &str, symlink_target: Option<&str>) -> ObjectKind {
    if is_dir_name(name) {
        ObjectKind::Directory
    } else if symlink_target.is_some() {
        ObjectKind::Symlink
    } else {
        ObjectKind::Regular
    }
}
