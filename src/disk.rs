//! Disk-work channel — funnels every local filesystem operation a worker
//! needs through one background task, so a worker's own async loop never
//! blocks directly on `tokio::fs` and a single channel, not a mutex,
//! serialises concurrent writers touching the same destination tree.
//!
//! Grounded on the worker-task style of `pool::spawn_pool_maintenance`
//! spawns a background `tokio::spawn` loop that a handle can be awaited
//! against); this generalizes that one-task-one-job pattern into a
//! request/reply channel carrying the six disk-operation kinds the engine
//! distinguishes.

use crate::config::OverwritePolicy;
use crate::error::{EngineError, EngineResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum DiskRequestKind {
    CreateDir(PathBuf),
    /// `dir`/`name` arrive split, not pre-joined, so `Autorename` can try
    /// successive names against the same directory without the caller
    /// re-deriving one from a full path.
    CreateFile { dir: PathBuf, name: String, policy: OverwritePolicy },
    /// Re-attempt creating a file that previously failed (e.g. the parent
    /// directory didn't exist yet and has since been created).
    RetryCreated { path: PathBuf },
    /// Re-open a partially-downloaded file to continue writing at `offset`.
    RetryResumed { path: PathBuf, offset: u64 },
    OpenForReading(PathBuf),
    DeleteDir(PathBuf),
}

/// What `CreateFile` decided once it found (or didn't find) a pre-existing
/// target: state verdict, opened file, chosen overwrite flag, and
/// new-target-name on autorename.
pub enum CreateFileVerdict {
    Ready {
        file: fs::File,
        /// Differs from the name the caller asked for only when
        /// `OverwritePolicy::Autorename` had to dodge a collision.
        final_name: String,
        /// Nonzero only under `OverwritePolicy::Resume`; the byte offset
        /// the caller should `REST` to before re-issuing `RETR`.
        resume_offset: u64,
    },
    /// `OverwritePolicy::Skip` against an existing target — no file opened.
    Skip,
}

pub enum DiskOutcome {
    DirCreated,
    FileForWriting(CreateFileVerdict),
    FileForReading(fs::File),
    Deleted,
}

impl std::fmt::Debug for DiskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskOutcome::DirCreated => write!(f, "DirCreated"),
            DiskOutcome::FileForWriting(CreateFileVerdict::Ready { final_name, resume_offset, .. }) => {
                write!(f, "FileForWriting(Ready {{ final_name: {:?}, resume_offset: {} }})", final_name, resume_offset)
            }
            DiskOutcome::FileForWriting(CreateFileVerdict::Skip) => write!(f, "FileForWriting(Skip)"),
            DiskOutcome::FileForReading(_) => write!(f, "FileForReading(..)"),
            DiskOutcome::Deleted => write!(f, "Deleted"),
        }
    }
}

struct DiskRequest {
    kind: DiskRequestKind,
    reply: oneshot::Sender<EngineResult<DiskOutcome>>,
}

/// Handle a worker holds to submit disk work. Cloning shares the same
/// background task and its single-threaded serialisation of filesystem
/// mutations.
#[derive(Clone)]
pub struct DiskWorkChannel {
    tx: mpsc::Sender<DiskRequest>,
}

impl DiskWorkChannel {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run(rx));
        Self { tx }
    }

    async fn submit(&self, kind: DiskRequestKind) -> EngineResult<DiskOutcome> {
        let (reply, recv) = oneshot::channel();
        self.tx
            .send(DiskRequest { kind, reply })
            .await
            .map_err(|_| EngineError::io_error("disk worker task is gone"))?;
        recv.await.map_err(|_| EngineError::io_error("disk worker dropped the reply"))?
    }

    pub async fn create_dir(&self, path: impl Into<PathBuf>) -> EngineResult<()> {
        self.submit(DiskRequestKind::CreateDir(path.into())).await.map(|_| ())
    }

    pub async fn create_file(
        &self,
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        policy: OverwritePolicy,
    ) -> EngineResult<CreateFileVerdict> {
        match self
            .submit(DiskRequestKind::CreateFile { dir: dir.into(), name: name.into(), policy })
            .await?
        {
            DiskOutcome::FileForWriting(verdict) => Ok(verdict),
            _ => unreachable!("create_file always replies with FileForWriting or an error"),
        }
    }

    pub async fn retry_created(&self, path: impl Into<PathBuf>) -> EngineResult<fs::File> {
        match self.submit(DiskRequestKind::RetryCreated { path: path.into() }).await? {
            DiskOutcome::FileForWriting(CreateFileVerdict::Ready { file, .. }) => Ok(file),
            _ => unreachable!(),
        }
    }

    pub async fn retry_resumed(&self, path: impl Into<PathBuf>, offset: u64) -> EngineResult<fs::File> {
        match self
            .submit(DiskRequestKind::RetryResumed { path: path.into(), offset })
            .await?
        {
            DiskOutcome::FileForWriting(CreateFileVerdict::Ready { file, .. }) => Ok(file),
            _ => unreachable!(),
        }
    }

    pub async fn open_for_reading(&self, path: impl Into<PathBuf>) -> EngineResult<fs::File> {
        match self.submit(DiskRequestKind::OpenForReading(path.into())).await? {
            DiskOutcome::FileForReading(f) => Ok(f),
            _ => unreachable!(),
        }
    }

    pub async fn delete_dir(&self, path: impl Into<PathBuf>) -> EngineResult<()> {
        self.submit(DiskRequestKind::DeleteDir(path.into())).await.map(|_| ())
    }
}

async fn run(mut rx: mpsc::Receiver<DiskRequest>) {
    while let Some(req) = rx.recv().await {
        let result = handle(req.kind).await;
        let _ = req.reply.send(result);
    }
}

async fn ensure_parent(path: &Path) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

/// Resolve a `CreateFile` request against `policy`, consulting the
/// filesystem for a pre-existing `dir/name` exactly once up front — the
/// at-most-once guarantee a retrying caller relies on.
async fn resolve_create_file(dir: &Path, name: &str, policy: OverwritePolicy) -> EngineResult<CreateFileVerdict> {
    let path = dir.join(name);
    if !exists(&path).await {
        let file = fs::File::create(&path).await?;
        return Ok(CreateFileVerdict::Ready { file, final_name: name.to_string(), resume_offset: 0 });
    }

    match policy {
        OverwritePolicy::Overwrite => {
            let file = fs::File::create(&path).await?;
            Ok(CreateFileVerdict::Ready { file, final_name: name.to_string(), resume_offset: 0 })
        }
        OverwritePolicy::Skip => Ok(CreateFileVerdict::Skip),
        OverwritePolicy::Resume => {
            let resume_offset = fs::metadata(&path).await?.len();
            let mut file = fs::OpenOptions::new().write(true).open(&path).await?;
            use tokio::io::{AsyncSeekExt, SeekFrom};
            file.seek(SeekFrom::Start(resume_offset)).await?;
            Ok(CreateFileVerdict::Ready { file, final_name: name.to_string(), resume_offset })
        }
        OverwritePolicy::Autorename => {
            let final_name = find_free_name(dir, name).await?;
            let file = fs::File::create(dir.join(&final_name)).await?;
            Ok(CreateFileVerdict::Ready { file, final_name, resume_offset: 0 })
        }
    }
}

/// `report.txt` -> `report (2).txt`, `report (3).txt`, ... — the first
/// name in that sequence that doesn't already exist in `dir`.
async fn find_free_name(dir: &Path, name: &str) -> EngineResult<String> {
    let as_path = Path::new(name);
    let stem = as_path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = as_path.extension().and_then(|s| s.to_str());

    for n in 2..10_000u32 {
        let candidate = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        if !exists(&dir.join(&candidate)).await {
            return Ok(candidate);
        }
    }
    Err(EngineError::io_error(format!("no free autorename slot for {}", name)))
}

async fn handle(kind: DiskRequestKind) -> EngineResult<DiskOutcome> {
    match kind {
        DiskRequestKind::CreateDir(path) => {
            fs::create_dir_all(&path).await?;
            Ok(DiskOutcome::DirCreated)
        }
        DiskRequestKind::CreateFile { dir, name, policy } => {
            fs::create_dir_all(&dir).await?;
            let verdict = resolve_create_file(&dir, &name, policy).await?;
            Ok(DiskOutcome::FileForWriting(verdict))
        }
        DiskRequestKind::RetryCreated { path } => {
            ensure_parent(&path).await?;
            let file = fs::File::create(&path).await?;
            Ok(DiskOutcome::FileForWriting(CreateFileVerdict::Ready {
                file,
                final_name: path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string(),
                resume_offset: 0,
            }))
        }
        DiskRequestKind::RetryResumed { path, offset } => {
            use tokio::io::{AsyncSeekExt, SeekFrom};
            ensure_parent(&path).await?;
            let mut file = fs::OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            Ok(DiskOutcome::FileForWriting(CreateFileVerdict::Ready {
                file,
                final_name: path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string(),
                resume_offset: offset,
            }))
        }
        DiskRequestKind::OpenForReading(path) => {
            let file = fs::File::open(&path).await?;
            Ok(DiskOutcome::FileForReading(file))
        }
        DiskRequestKind::DeleteDir(path) => {
            fs::remove_dir_all(&path).await?;
            Ok(DiskOutcome::Deleted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn ready(v: CreateFileVerdict) -> (fs::File, String, u64) {
        match v {
            CreateFileVerdict::Ready { file, final_name, resume_offset } => (file, final_name, resume_offset),
            CreateFileVerdict::Skip => panic!("expected Ready, got Skip"),
        }
    }

    #[tokio::test]
    async fn create_dir_then_create_file_then_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();

        let nested = tmp.path().join("a/b/c");
        channel.create_dir(nested.clone()).await.unwrap();
        assert!(nested.is_dir());

        let (mut file, final_name, offset) =
            ready(channel.create_file(nested.clone(), "data.bin", OverwritePolicy::Overwrite).await.unwrap());
        assert_eq!(final_name, "data.bin");
        assert_eq!(offset, 0);
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let mut reader = channel.open_for_reading(nested.join("data.bin")).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn overwrite_policy_truncates_an_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();

        let (mut file, _, _) =
            ready(channel.create_file(tmp.path(), "report.txt", OverwritePolicy::Overwrite).await.unwrap());
        file.write_all(b"first version, much longer than the second").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let (mut file, final_name, _) =
            ready(channel.create_file(tmp.path(), "report.txt", OverwritePolicy::Overwrite).await.unwrap());
        assert_eq!(final_name, "report.txt");
        file.write_all(b"v2").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let contents = tokio::fs::read(tmp.path().join("report.txt")).await.unwrap();
        assert_eq!(contents, b"v2");
    }

    #[tokio::test]
    async fn skip_policy_leaves_the_existing_target_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();

        let (mut file, _, _) =
            ready(channel.create_file(tmp.path(), "keep.txt", OverwritePolicy::Overwrite).await.unwrap());
        file.write_all(b"original").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let verdict = channel.create_file(tmp.path(), "keep.txt", OverwritePolicy::Skip).await.unwrap();
        assert!(matches!(verdict, CreateFileVerdict::Skip));

        let contents = tokio::fs::read(tmp.path().join("keep.txt")).await.unwrap();
        assert_eq!(contents, b"original");
    }

    #[tokio::test]
    async fn autorename_policy_finds_the_first_free_numbered_name() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();

        channel.create_file(tmp.path(), "report.txt", OverwritePolicy::Overwrite).await.unwrap();
        tokio::fs::write(tmp.path().join("report (2).txt"), b"taken").await.unwrap();

        let (_, final_name, _) =
            ready(channel.create_file(tmp.path(), "report.txt", OverwritePolicy::Autorename).await.unwrap());
        assert_eq!(final_name, "report (3).txt");
        assert!(tmp.path().join("report (3).txt").exists());
        assert!(tmp.path().join("report.txt").exists());
    }

    #[tokio::test]
    async fn resume_policy_seeks_to_the_existing_length() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();

        let (mut file, _, _) =
            ready(channel.create_file(tmp.path(), "partial.bin", OverwritePolicy::Overwrite).await.unwrap());
        file.write_all(b"0123456789").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let (mut file, _, offset) =
            ready(channel.create_file(tmp.path(), "partial.bin", OverwritePolicy::Resume).await.unwrap());
        assert_eq!(offset, 10);
        file.write_all(b"XXXXX").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let contents = tokio::fs::read(tmp.path().join("partial.bin")).await.unwrap();
        assert_eq!(contents, b"0123456789XXXXX");
    }

    #[tokio::test]
    async fn retry_resumed_seeks_to_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();
        let path = tmp.path().join("resume.bin");

        let (mut file, _, _) = ready(channel.create_file(tmp.path(), "resume.bin", OverwritePolicy::Overwrite).await.unwrap());
        file.write_all(b"0123456789").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let mut resumed = channel.retry_resumed(path.clone(), 5).await.unwrap();
        resumed.write_all(b"XXXXX").await.unwrap();
        resumed.flush().await.unwrap();
        drop(resumed);

        let contents = tokio::fs::read(path).await.unwrap();
        assert_eq!(contents, b"01234XXXXX");
    }

    #[tokio::test]
    async fn delete_dir_removes_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DiskWorkChannel::spawn();
        let nested = tmp.path().join("victim/sub");
        channel.create_dir(nested.clone()).await.unwrap();
        channel.delete_dir(tmp.path().join("victim")).await.unwrap();
        assert!(!tmp.path().join("victim").exists());
    }
}
