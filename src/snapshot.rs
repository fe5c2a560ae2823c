// durable snapshots of the whole aggregate
// every save writes a historical generation `{base}-{millis}-{seq}.json` and
// then replaces `latest.json`, both through a temporary file and a rename, so an
// observer of the directory only ever sees complete files
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tokio::{fs, io::AsyncWriteExt as _};
use tracing::{debug, warn};

use crate::{expiry::unix_millis, register::Aggregate};

pub const LATEST: &str = "latest.json";

#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    base_name: String,
    // number of historical generations retained, `None` keeps everything
    keep: Option<usize>,
    seq: u64,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>, keep: Option<usize>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
            keep,
            seq: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&mut self, state: &Aggregate) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create snapshot directory {}", self.dir.display()))?;
        let bytes = serde_json::to_vec_pretty(state)?;
        self.seq += 1;
        let name = format!("{}-{:013}-{:06}.json", self.base_name, unix_millis(), self.seq);
        write_atomic(&self.dir.join(name), &bytes).await?;
        write_atomic(&self.dir.join(LATEST), &bytes).await?;
        if let Err(err) = self.prune().await {
            warn!("prune snapshots in {}: {err:#}", self.dir.display())
        }
        Ok(())
    }

    /// The most recent valid snapshot: `latest.json` if it parses, otherwise
    /// the newest historical generation that does. `None` if there is none.
    pub async fn load(&self) -> anyhow::Result<Option<Aggregate>> {
        match read_state(&self.dir.join(LATEST)).await {
            Ok(Some(state)) => return Ok(Some(state)),
            Ok(None) => {}
            Err(err) => warn!("{err:#}, falling back to historical snapshots"),
        }
        for path in self.history().await?.into_iter().rev() {
            match read_state(&path).await {
                Ok(Some(state)) => return Ok(Some(state)),
                Ok(None) => {}
                Err(err) => warn!("{err:#}"),
            }
        }
        Ok(None)
    }

    pub async fn prune(&self) -> anyhow::Result<usize> {
        let Some(keep) = self.keep else {
            return Ok(0);
        };
        let history = self.history().await?;
        let excess = history.len().saturating_sub(keep);
        for path in &history[..excess] {
            fs::remove_file(path)
                .await
                .with_context(|| format!("remove {}", path.display()))?;
            debug!("pruned {}", path.display())
        }
        Ok(excess)
    }

    // historical generations, oldest first. the fixed width name fields make
    // lexical order chronological
    async fn history(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("list {}", self.dir.display())),
        };
        let prefix = format!("{}-", self.base_name);
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                paths.push(entry.path())
            }
        }
        paths.sort();
        Ok(paths)
    }
}

async fn read_state(path: &Path) -> anyhow::Result<Option<Aggregate>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let state = serde_json::from_slice(&bytes)
        .with_context(|| format!("corrupted snapshot {}", path.display()))?;
    Ok(Some(state))
}

pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid snapshot path {}", path.display()))?;
    // hidden and suffixed, never matched as a generation
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    let mut file = fs::File::create(&temp)
        .await
        .with_context(|| format!("create {}", temp.display()))?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, path)
        .await
        .with_context(|| format!("rename {} to {}", temp.display(), path.display()))
}
