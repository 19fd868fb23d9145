//! Small helpers shared by compaction and the partition operations.

use std::fs;
use std::io;
use std::path::Path;

/// A worker thread panicked while running a parallel task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerPanicked;

/// Run `task` over `items` on up to `parallelism` scoped worker threads.
///
/// Items are handed out through a channel, so a slow item does not hold
/// back the others.  With one worker (or one item) everything runs on the
/// calling thread.  The first error stops the worker that hit it; the
/// remaining workers drain the queue and the first error is returned.
/// Result order is unspecified.
pub(crate) fn run_parallel<T, R, E, F>(
    items: Vec<T>,
    parallelism: usize,
    task: F,
) -> Result<Vec<R>, E>
where
    T: Send,
    R: Send,
    E: Send + From<WorkerPanicked>,
    F: Fn(T) -> Result<R, E> + Sync,
{
    let workers = parallelism.max(1).min(items.len());
    if workers <= 1 {
        return items.into_iter().map(&task).collect();
    }

    let (sender, receiver) = crossbeam::channel::unbounded::<T>();
    for item in items {
        // The receiver is alive for the whole function, so this never fails.
        let _ = sender.send(item);
    }
    drop(sender);

    let task = &task;
    crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = receiver.clone();
                scope.spawn(move |_| -> Result<Vec<R>, E> {
                    let mut out = Vec::new();
                    while let Ok(item) = rx.recv() {
                        out.push(task(item)?);
                    }
                    Ok(out)
                })
            })
            .collect();

        let mut results = Vec::new();
        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(mut part)) => results.append(&mut part),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(E::from(WorkerPanicked));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    })
    .unwrap_or_else(|_| Err(E::from(WorkerPanicked)))
}

/// Remove `path`, treating "already gone" as success.
///
/// Returns whether a file was removed.
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove the directory tree at `path`, treating "already gone" as success.
pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
