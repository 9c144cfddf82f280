//! persistence — the curated dataset of hand-picked frames
//!
//! Layout: `{dataset_dir}/{id}.png` plus an append-only index file with one
//! ID per line.  A save is committed once its ID line is durable in the
//! index:
//!
//! 1. encode the PNG into a hidden `.pending-*` file in the dataset dir, fsync
//! 2. rename it to `{id}.png` (fails rather than overwrite)
//! 3. append `{id}` to the index, fsync
//!
//! The index file is created before step 2, so an image can only ever be
//! committed next to an existing index.  If step 3 fails the index is cut
//! back to its old length and the image is removed again.  What a crash can
//! leave behind (pending files, and `{next_id}.png`) is removed the next time
//! the store is opened.  Numbered images that no interrupted save could have
//! produced are never deleted: opening fails instead.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use image::ImageFormat;
use tracing::{debug, info, warn};

use crate::error::{CurationError, Result};
use crate::video::RgbFrame;

const PENDING_PREFIX: &str = ".pending-";

pub struct CuratedStore {
    dir: PathBuf,
    index_path: PathBuf,
    /// Held for the whole read-last / write / append sequence.
    writer: Mutex<()>,
}

impl std::fmt::Debug for CuratedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuratedStore")
            .field("dir", &self.dir)
            .field("index_path", &self.index_path)
            .finish_non_exhaustive()
    }
}

impl CuratedStore {
    /// Open (creating if needed) the dataset at `dir` with the index file
    /// named `index_file` inside it, discarding uncommitted leftovers.
    pub fn open<P: AsRef<Path>>(dir: P, index_file: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| CurationError::persistence(&format!("create {}", dir.display()), e))?;

        let store = Self {
            index_path: dir.join(index_file),
            dir,
            writer: Mutex::new(()),
        };
        let removed = store.recover()?;
        info!(
            dir = %store.dir.display(),
            last_id = ?store.last_id()?,
            removed,
            "opened curated dataset"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Last committed ID, `None` for an empty or absent index.
    pub fn last_id(&self) -> Result<Option<u64>> {
        read_last_id(&self.index_path)
    }

    pub fn next_id(&self) -> Result<u64> {
        Ok(self.last_id()?.map_or(0, |last| last + 1))
    }

    pub fn image_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.png"))
    }

    /// Persist `frame` as the next curated image and return its ID.
    pub fn save(&self, frame: &RgbFrame) -> Result<u64> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let id = self.next_id()?;
        let mut index = open_index(&self.index_path).map_err(|e| {
            CurationError::persistence(&format!("open {}", self.index_path.display()), e)
        })?;
        let mut png = Cursor::new(Vec::new());
        frame
            .to_image()?
            .write_to(&mut png, ImageFormat::Png)
            .map_err(|e| CurationError::persistence("encode png", e))?;

        let mut pending = tempfile::Builder::new()
            .prefix(PENDING_PREFIX)
            .suffix(".png")
            .tempfile_in(&self.dir)
            .map_err(|e| CurationError::persistence("create temp image", e))?;
        pending
            .write_all(png.get_ref())
            .and_then(|_| pending.as_file().sync_all())
            .map_err(|e| CurationError::persistence("write temp image", e))?;

        let target = self.image_path(id);
        pending
            .persist_noclobber(&target)
            .map_err(|e| CurationError::persistence(&format!("commit {}", target.display()), e.error))?;
        debug!(id, path = %target.display(), "image in place; appending index");

        if let Err(e) = append_id(&mut index, id) {
            if let Err(cleanup) = fs::remove_file(&target) {
                warn!(path = %target.display(), error = %cleanup, "could not remove uncommitted image");
            }
            return Err(CurationError::persistence("append index", e));
        }

        info!(id, path = %target.display(), "saved curated frame");
        Ok(id)
    }

    /// Remove pending temp files and the image of a save that never reached
    /// the index.  Refuses to open a directory whose numbered images the
    /// index cannot account for.
    fn recover(&self) -> Result<usize> {
        let has_index = self.index_path.try_exists().map_err(|e| {
            CurationError::persistence(&format!("stat {}", self.index_path.display()), e)
        })?;
        let next = self.next_id()?;

        let mut pending = Vec::new();
        let mut orphan = None;
        let mut unaccounted = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| CurationError::persistence(&format!("list {}", self.dir.display()), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(PENDING_PREFIX) {
                pending.push(entry.path());
                continue;
            }
            let Some(id) = name.strip_suffix(".png").and_then(|stem| stem.parse::<u64>().ok()) else {
                continue;
            };
            if !has_index || id > next {
                unaccounted.push(id);
            } else if id == next {
                orphan = Some(entry.path());
            }
        }

        if !unaccounted.is_empty() {
            unaccounted.sort_unstable();
            let ids: Vec<String> = unaccounted.iter().map(u64::to_string).collect();
            let reason = if has_index {
                format!("beyond the next ID {next}")
            } else {
                format!("but {} does not exist", self.index_path.display())
            };
            return Err(CurationError::PersistenceError(format!(
                "{} holds numbered images ({}) {reason}; refusing to open it",
                self.dir.display(),
                ids.join(", ")
            )));
        }

        let mut removed = 0;
        for path in pending.into_iter().chain(orphan) {
            fs::remove_file(&path).map_err(|e| {
                CurationError::persistence(&format!("remove {}", path.display()), e)
            })?;
            warn!(file = %path.display(), "removed uncommitted file from dataset");
            removed += 1;
        }
        Ok(removed)
    }
}

/// Parse the index: blank lines (the leading newline older tools wrote)
/// are skipped, every other line must be an integer.
fn read_last_id(index_path: &Path) -> Result<Option<u64>> {
    let text = match fs::read_to_string(index_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CurationError::persistence(
                &format!("read {}", index_path.display()),
                e,
            ))
        }
    };

    let mut last = None;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id = line.parse::<u64>().map_err(|_| {
            CurationError::PersistenceError(format!(
                "{} line {}: {line:?} is not an ID",
                index_path.display(),
                lineno + 1
            ))
        })?;
        last = Some(id);
    }
    Ok(last)
}

/// The index operations a save needs.
trait IndexFile: Read + Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl IndexFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

fn open_index(index_path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(index_path)
}

/// Append `id` as a line.  On failure the file is cut back to the length it
/// had before, so a partial line never survives.
fn append_id<F: IndexFile>(file: &mut F, id: u64) -> io::Result<()> {
    let len = file.seek(SeekFrom::End(0))?;
    let result = write_id_line(file, len, id);
    if result.is_err() {
        if let Err(e) = file.truncate(len) {
            warn!(error = %e, len, "could not roll back the index");
        }
    }
    result
}

fn write_id_line<F: IndexFile>(file: &mut F, len: u64, id: u64) -> io::Result<()> {
    // Files written without a trailing newline get one before our entry.
    let mut line = String::new();
    if len > 0 {
        let mut tail = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut tail)?;
        if tail[0] != b'\n' {
            line.push('\n');
        }
    }
    line.push_str(&format!("{id}\n"));

    file.seek(SeekFrom::End(0))?;
    file.write_all(line.as_bytes())?;
    file.sync()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use image::{Rgb, RgbImage};

    fn frame(seed: u8) -> RgbFrame {
        let image = RgbImage::from_fn(6, 4, |x, y| Rgb([x as u8 * 40, y as u8 * 60, seed]));
        RgbFrame::from_image(image, seed as usize)
    }

    fn index_ids(store: &CuratedStore) -> Vec<u64> {
        fs::read_to_string(store.index_path())
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().parse().unwrap())
            .collect()
    }

    #[test]
    fn first_saves_are_zero_then_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = CuratedStore::open(dir.path().join("local_dataset"), "index.txt").unwrap();
        assert_eq!(store.dir(), dir.path().join("local_dataset"));
        assert_eq!(store.last_id().unwrap(), None);

        let first = frame(1);
        assert_eq!(store.save(&first).unwrap(), 0);
        assert_eq!(store.save(&frame(2)).unwrap(), 1);

        assert_eq!(
            fs::read_to_string(store.index_path()).unwrap(),
            "0\n1\n"
        );
        let saved = image::open(store.image_path(0)).unwrap().into_rgb8();
        assert_eq!(saved, first.to_image().unwrap());
        assert!(store.image_path(1).exists());
    }

    #[test]
    fn continues_an_index_written_by_the_old_tool() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.txt"), "\n1\n2\n3").unwrap();
        for id in 1..=3 {
            fs::write(dir.path().join(format!("{id}.png")), b"x").unwrap();
        }

        let store = CuratedStore::open(dir.path(), "index.txt").unwrap();
        assert_eq!(store.last_id().unwrap(), Some(3));
        assert_eq!(store.save(&frame(0)).unwrap(), 4);
        assert_eq!(
            fs::read_to_string(store.index_path()).unwrap(),
            "\n1\n2\n3\n4\n"
        );
        // Committed images are never touched.
        assert_eq!(fs::read(dir.path().join("3.png")).unwrap(), b"x");
    }

    #[test]
    fn open_removes_uncommitted_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.txt"), "0\n").unwrap();
        fs::write(dir.path().join("0.png"), b"kept").unwrap();
        fs::write(dir.path().join("1.png"), b"orphan").unwrap();
        fs::write(dir.path().join(".pending-abc.png"), b"half").unwrap();
        fs::write(dir.path().join("notes.md"), b"unrelated").unwrap();

        let store = CuratedStore::open(dir.path(), "index.txt").unwrap();
        assert!(dir.path().join("0.png").exists());
        assert!(!dir.path().join("1.png").exists());
        assert!(!dir.path().join(".pending-abc.png").exists());
        assert!(dir.path().join("notes.md").exists());

        assert_eq!(store.save(&frame(3)).unwrap(), 1);
        assert_eq!(index_ids(&store), vec![0, 1]);
    }

    #[test]
    fn interrupted_first_save_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.txt"), "").unwrap();
        fs::write(dir.path().join("0.png"), b"orphan").unwrap();

        let store = CuratedStore::open(dir.path(), "index.txt").unwrap();
        assert!(!dir.path().join("0.png").exists());
        assert_eq!(store.save(&frame(1)).unwrap(), 0);
    }

    #[test]
    fn numbered_images_without_an_index_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        for id in 0..3 {
            fs::write(dir.path().join(format!("{id}.png")), b"someone's work").unwrap();
        }
        fs::write(dir.path().join(".pending-x.png"), b"half").unwrap();

        let err = CuratedStore::open(dir.path(), "index.txt").unwrap_err();
        assert!(matches!(err, CurationError::PersistenceError(_)), "{err}");
        for id in 0..3 {
            assert!(dir.path().join(format!("{id}.png")).exists());
        }
        assert!(dir.path().join(".pending-x.png").exists());
    }

    #[test]
    fn images_beyond_the_next_id_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.txt"), "0\n").unwrap();
        for id in [0, 1, 5] {
            fs::write(dir.path().join(format!("{id}.png")), b"x").unwrap();
        }

        let err = CuratedStore::open(dir.path(), "index.txt").unwrap_err();
        assert!(err.to_string().contains("(5) beyond the next ID 1"), "{err}");
        for id in [0, 1, 5] {
            assert!(dir.path().join(format!("{id}.png")).exists());
        }
    }

    /// In-memory index that fails after `budget` bytes or on sync.
    struct FailingIndex {
        data: Cursor<Vec<u8>>,
        budget: usize,
        fail_sync: bool,
    }

    impl FailingIndex {
        fn new(contents: &str, budget: usize, fail_sync: bool) -> Self {
            Self {
                data: Cursor::new(contents.as_bytes().to_vec()),
                budget,
                fail_sync,
            }
        }

        fn contents(&self) -> &str {
            std::str::from_utf8(self.data.get_ref()).unwrap()
        }
    }

    impl Read for FailingIndex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl Seek for FailingIndex {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    impl Write for FailingIndex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.data.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl IndexFile for FailingIndex {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.get_mut().truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.fail_sync {
                Err(io::Error::other("fsync failed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn append_adds_a_line_after_an_unterminated_one() {
        let mut index = FailingIndex::new("0\n1", usize::MAX, false);
        append_id(&mut index, 2).unwrap();
        assert_eq!(index.contents(), "0\n1\n2\n");
    }

    #[test]
    fn partial_append_is_rolled_back() {
        // "\n2\n" needs three bytes; only two get through.
        let mut index = FailingIndex::new("0\n1", 2, false);
        assert!(append_id(&mut index, 2).is_err());
        assert_eq!(index.contents(), "0\n1");
        assert_eq!(read_last_id_from(index.contents()), Some(1));
    }

    #[test]
    fn failed_sync_is_rolled_back() {
        let mut index = FailingIndex::new("0\n", usize::MAX, true);
        assert!(append_id(&mut index, 1).is_err());
        assert_eq!(index.contents(), "0\n");
    }

    fn read_last_id_from(contents: &str) -> Option<u64> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.txt");
        fs::write(&path, contents).unwrap();
        read_last_id(&path).unwrap()
    }

    #[test]
    fn garbage_index_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.txt"), "0\nseven\n").unwrap();
        let err = CuratedStore::open(dir.path(), "index.txt").unwrap_err();
        assert!(matches!(err, CurationError::PersistenceError(_)));
    }

    #[test]
    fn unusable_index_leaves_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = CuratedStore::open(dir.path(), "index.txt").unwrap();
        assert_eq!(store.save(&frame(0)).unwrap(), 0);

        // Swap the index for something that cannot be parsed or appended to.
        fs::remove_file(store.index_path()).unwrap();
        fs::create_dir(store.index_path()).unwrap();

        let err = store.save(&frame(1)).unwrap_err();
        assert!(matches!(err, CurationError::PersistenceError(_)));
        let pngs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".png"))
            .collect();
        assert_eq!(pngs.len(), 1, "only the committed 0.png remains");
    }

    #[test]
    fn concurrent_saves_get_distinct_consecutive_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CuratedStore::open(dir.path(), "index.txt").unwrap());

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..5u8)
                        .map(|i| store.save(&frame(t * 10 + i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
        assert_eq!(index_ids(&store), (0..20).collect::<Vec<_>>());
    }
}
