//! Unique sibling names for atomic file replacement.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hidden temp name next to `target`.
/// Pattern: .<file_name>.<pid>.<nanos>.<seq>.tmp
pub(crate) fn tmp_sibling_name(target: &Path) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let stem = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let name = format!(".{stem}.{pid}.{nanos}.{seq}.tmp");
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn uniqueness_concurrent() {
        let target = Path::new("db/CURRENT");
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let t = target.to_path_buf();
                thread::spawn(move || tmp_sibling_name(&t))
            })
            .collect();
        let mut set = HashSet::new();
        for h in handles {
            let p = h.join().unwrap();
            assert_eq!(p.parent(), Some(Path::new("db")));
            assert!(set.insert(p));
        }
        assert_eq!(set.len(), 32);
    }

    #[test]
    fn temp_name_is_hidden_and_tagged() {
        let p = tmp_sibling_name(Path::new("/data/MANIFEST-000001"));
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".MANIFEST-000001."));
        assert!(name.ends_with(".tmp"));
    }
}
