use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf},
};

/// Utility function to replace separators and convert to unicode (via to_string_lossy) on os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    os_path_ref
        .as_ref()
        .components()
        .map(|c| match c {
            Component::RootDir => Cow::from("".to_string()),
            _ => c.as_os_str().to_string_lossy(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve `.` and `..` components without touching the filesystem.
pub fn lexical_normalize<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether the host's default filesystems ignore case when opening files.
pub const FOLDS_CASE: bool = cfg!(any(windows, target_os = "macos"));

/// Lookup key for a record file path. Separator style and `.`/`..` segments never matter; case
/// is folded only on hosts whose filesystems ignore it, so two files that can coexist on disk
/// never share a key.
pub fn normalize_key<P: AsRef<Path>>(path: P) -> String {
    let key = os_path_to_string(lexical_normalize(path));
    if FOLDS_CASE {
        key.to_uppercase()
    } else {
        key
    }
}

/// True when `path` lies under `root`, compared the way [normalize_key] compares.
pub fn is_within<R: AsRef<Path>, P: AsRef<Path>>(root: R, path: P) -> bool {
    let root_key = normalize_key(root);
    let path_key = normalize_key(path);
    let root_key = root_key.trim_end_matches('/');
    path_key.len() > root_key.len()
        && path_key.starts_with(root_key)
        && path_key[root_key.len()..].starts_with('/')
}
