//! A process-local FIFO queue backed by a directory tree: one subdirectory of the
//! project root per queue, one file per message.
//!
//! Publication is atomic against concurrent scanners (scratch-dir write, then rename),
//! and consumption honors publish order by file *modification time*, not name — renaming
//! a file into place doesn't reorder it relative to siblings already there. Message file
//! names are still generated as a lexicographically sortable id so an on-disk listing
//! (`ls`, a directory walk) reads in publish order too, even though `get`/`work` don't
//! rely on that here.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queue {0:?} does not exist")]
    NoSuchQueue(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A message pulled off a queue.
#[derive(Debug, Clone)]
pub struct Message {
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// A filesystem-backed FIFO queue rooted at `root`.
pub struct LocalQueue {
    root: PathBuf,
}

impl LocalQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue)
    }

    /// Whether `queue` has a directory on disk.
    pub fn exists(&self, queue: &str) -> bool {
        self.queue_dir(queue).is_dir()
    }

    /// The short display name for a queue. `LocalQueue` has no nesting beyond a flat
    /// directory per queue, so this is the identity — kept to satisfy the broker
    /// interface other queue backends in this family implement.
    pub fn short_name<'a>(&self, queue: &'a str) -> &'a str {
        queue
    }

    /// `LocalQueue` never encrypts message bodies.
    pub fn is_encrypted(&self, _queue: &str) -> bool {
        false
    }

    /// Not implemented for this backend, as in the original.
    pub fn responder(&self, _queue: &str) -> Option<()> {
        None
    }

    /// Publish `payload` to `queue`. If `allow_create` is false and the queue doesn't
    /// already exist, this fails rather than creating it.
    pub fn publish(
        &self,
        queue: &str,
        content_type: &str,
        payload: &[u8],
        allow_create: bool,
    ) -> Result<(), Error> {
        let dir = self.queue_dir(queue);
        if !dir.is_dir() {
            if !allow_create {
                return Err(Error::NoSuchQueue(queue.to_string()));
            }
            fs_err::create_dir_all(&dir)?;
        }

        let id = rr_fs::unique_id();
        let file_name = format!("{id}.{content_type}");
        rr_fs::write_atomic(&dir, &file_name, payload)?;
        tracing::debug!(queue, content_type, bytes = payload.len(), "published message");
        Ok(())
    }

    /// Remove and return the oldest message in `queue`, or `None` if it's empty.
    pub fn get(&self, queue: &str) -> Result<Option<Message>, Error> {
        let Some(path) = self.oldest_message(queue)? else {
            return Ok(None);
        };
        let payload = fs_err::read(&path)?;
        let content_type = content_type_of(&path);
        fs_err::remove_file(&path)?;
        Ok(Some(Message { content_type, payload }))
    }

    /// Whether `queue` has at least one message, without consuming it.
    pub fn has_work(&self, queue: &str) -> Result<bool, Error> {
        Ok(self.oldest_message(queue)?.is_some())
    }

    fn oldest_message(&self, queue: &str) -> Result<Option<PathBuf>, Error> {
        let dir = self.queue_dir(queue);
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut oldest: Option<(SystemTime, PathBuf)> = None;
        for entry in fs_err::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".scratch-") {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let is_older = match &oldest {
                Some((t, _)) => modified < *t,
                None => true,
            };
            if is_older {
                oldest = Some((modified, entry.path()));
            }
        }
        Ok(oldest.map(|(_, path)| path))
    }

    /// Pull one message and hand it to `handler`, which returns `(resource, ack)`.
    /// `ack == false` re-publishes the payload as a fresh message (there is no
    /// visibility-timeout semantics to rely on, since the queue is process-local).
    /// Returns `Ok(None)` if the queue was empty.
    pub async fn work<F, Fut, R>(&self, queue: &str, handler: F) -> Result<Option<R>, Error>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = (R, bool)>,
    {
        let Some(message) = self.get(queue)? else {
            return Ok(None);
        };
        let content_type = message.content_type.clone();
        let payload = message.payload.clone();
        let (resource, ack) = handler(message).await;
        if !ack {
            tracing::warn!(queue, content_type, "handler nacked message, republishing");
            self.publish(queue, &content_type, &payload, true)?;
        }
        Ok(Some(resource))
    }

    /// List queue names under the project root whose name matches `matcher` and, if
    /// given, does not match `mismatcher`.
    pub fn refresh(&self, matcher: &Regex, mismatcher: Option<&Regex>) -> Result<Vec<String>, Error> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs_err::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matcher.is_match(&name) {
                continue;
            }
            if mismatcher.is_some_and(|re| re.is_match(&name)) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

fn content_type_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}
