use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};

pub const FILES_CHANGED_EVENT: &str = "fileschangedevent";

/// Pushed to clients whenever the Inbox tree changes. Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesChanged;

/// Relative path -> (size, modification time) of every visible file.
pub type Snapshot = BTreeMap<PathBuf, (u64, Option<SystemTime>)>;

pub fn snapshot(root: &Path) -> io::Result<Snapshot> {
    let mut files = Snapshot::new();
    collect(root, root, &mut files)?;
    Ok(files)
}

fn collect(root: &Path, dir: &Path, files: &mut Snapshot) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            // removed while scanning, the next tick sees it gone
            Err(why) if why.kind() == io::ErrorKind::NotFound => continue,
            Err(why) => return Err(why),
        };

        if metadata.is_dir() {
            collect(root, &path, files)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            files.insert(relative, (metadata.len(), metadata.modified().ok()));
        }
    }
    Ok(())
}

async fn scan(root: &Path) -> Option<Snapshot> {
    let dir = root.to_path_buf();
    match tokio::task::spawn_blocking(move || snapshot(&dir)).await {
        Ok(Ok(files)) => Some(files),
        Ok(Err(why)) => {
            tracing::warn!("failed to scan {}: {}", root.display(), why);
            None
        }
        Err(why) => {
            tracing::error!("watcher scan task failed: {}", why);
            None
        }
    }
}

/// Polls `root` every `interval` and broadcasts [`FilesChanged`] when the
/// snapshot differs from the previous one. Returns once `shutdown` flips to true.
pub async fn watch_directory(
    root: PathBuf,
    interval: Duration,
    events: broadcast::Sender<FilesChanged>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        "watching {} every {}ms",
        root.display(),
        interval.as_millis()
    );

    let mut previous = scan(&root).await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let Some(current) = scan(&root).await else {
            continue;
        };
        if previous.as_ref() != Some(&current) {
            if previous.is_some() {
                tracing::debug!("change detected in {}", root.display());
                // no subscribers is fine
                let _ = events.send(FilesChanged);
            }
            previous = Some(current);
        }
    }

    tracing::info!("stopped watching {}", root.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[test]
    fn snapshot_is_recursive_and_skips_hidden_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.pdf"), b"a").unwrap();
        fs::write(dir.path().join("sub").join("b.pdf"), b"bb").unwrap();
        fs::write(dir.path().join(".hidden.tmp"), b"x").unwrap();

        let files = snapshot(dir.path()).unwrap();

        let paths: Vec<&Path> = files.keys().map(PathBuf::as_path).collect();
        assert_eq!(paths, [Path::new("a.pdf"), Path::new("sub/b.pdf")]);
        assert_eq!(files[Path::new("sub/b.pdf")].0, 2);
    }

    #[tokio::test]
    async fn new_files_are_broadcast_and_shutdown_stops_the_watcher() {
        let dir = TempDir::new().unwrap();
        let (events, mut receiver) = broadcast::channel(8);
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(watch_directory(
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            events,
            shutdown,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(dir.path().join("new.pdf"), b"%PDF").unwrap();

        let event = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("no change event")
            .unwrap();
        assert_eq!(event, FilesChanged);

        stop.send(true).unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn missing_root_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("later");
        let (events, _receiver) = broadcast::channel(8);
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(watch_directory(
            root,
            Duration::from_millis(10),
            events,
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!handle.is_finished());

        stop.send(true).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
