//! Folder helpers: recursive file listing and re-rooting of paths recorded
//! on another machine.

use log::warn;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Every file below `root`, as absolute paths in a stable order.
pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut files: Vec<PathBuf> = WalkDir::new(&root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Re-roots `foreign` under `base`, starting at the last component named
/// `anchor`. Returns `None` when `foreign` does not contain the anchor.
///
/// `rebase_path("anime", "/old/box/anime/s1/e1.mkv", "/data")` gives
/// `/data/anime/s1/e1.mkv`.
pub fn rebase_path(anchor: &str, foreign: &Path, base: &Path) -> Option<PathBuf> {
    let components: Vec<Component> = foreign.components().collect();
    let position = components
        .iter()
        .rposition(|c| matches!(c, Component::Normal(name) if *name == anchor))?;

    let mut rebased = base.to_path_buf();
    for component in &components[position..] {
        rebased.push(component.as_os_str());
    }
    Some(rebased)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebases_from_the_anchor() {
        let rebased = rebase_path("anime", Path::new("/old/box/anime/s1/e1.mkv"), Path::new("/data"));
        assert_eq!(rebased, Some(PathBuf::from("/data/anime/s1/e1.mkv")));
    }

    #[test]
    fn uses_the_deepest_anchor() {
        let rebased = rebase_path("samples", Path::new("/samples/x/samples/a.png"), Path::new("/b"));
        assert_eq!(rebased, Some(PathBuf::from("/b/samples/a.png")));
    }

    #[test]
    fn missing_anchor_is_none() {
        assert_eq!(rebase_path("anime", Path::new("/old/box/films/e1.mkv"), Path::new("/data")), None);
        // Partial names are not anchors.
        assert_eq!(rebase_path("anime", Path::new("/old/animes/e1.mkv"), Path::new("/data")), None);
    }

    #[test]
    fn walks_nested_files_sorted() {
        let root = std::env::temp_dir().join(format!("framehunt-walk-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("b/c")).unwrap();
        std::fs::write(root.join("b/c/z.png"), b"z").unwrap();
        std::fs::write(root.join("a.png"), b"a").unwrap();

        let files = walk_files(&root);
        assert_eq!(files, vec![root.join("a.png"), root.join("b/c/z.png")]);
        assert!(files.iter().all(|f| f.is_absolute()));

        std::fs::remove_dir_all(&root).unwrap();
    }
}
