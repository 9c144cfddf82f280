//! browser — stateful navigation over `species/{species}/{date}/{file}`
//!
//! The operator drives a `Browser` with `Command`s.  `update` applies one
//! command to the `SessionState` and reports the side effect the caller
//! should perform; `dispatch` also performs it against a `CuratedStore`.
//!
//! Every command either succeeds completely or leaves the selection and the
//! displayed frame exactly as they were.  Work that can fail (listing a
//! directory, opening the video, decoding the frame) happens on a scratch
//! copy of the state, which is committed only at the end.

use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{CurationError, Result};
use crate::persistence::CuratedStore;
use crate::video::{RgbFrame, VideoSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SelectSpecies(String),
    SelectDate(String),
    SelectFile(String),
    NavigateFile(Direction),
    JumpRandomFrame,
    SetFrame(i64),
    SaveFrame,
}

/// What the caller has to do after a successful `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing changed (boundary navigation, nothing to save).
    None,
    /// The displayed frame changed or was cleared.
    Redraw,
    /// Persist the displayed frame.
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Redrawn,
    Saved { id: u64 },
}

/// How far down the hierarchy the current selection reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    SpeciesSelected,
    DateSelected,
    FileSelected,
    FramePositioned,
}

/// The selection and the listings it was resolved against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub species: Option<String>,
    pub date: Option<String>,
    pub file: Option<String>,
    pub frame_index: Option<usize>,
    pub frame_count: usize,
    /// Dates under the selected species.
    pub dates: Vec<String>,
    /// Files under the selected date.
    pub files: Vec<String>,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match (&self.species, &self.date, &self.file, self.frame_index) {
            (Some(_), Some(_), Some(_), Some(_)) => Phase::FramePositioned,
            (Some(_), Some(_), Some(_), None) => Phase::FileSelected,
            (Some(_), Some(_), None, _) => Phase::DateSelected,
            (Some(_), None, _, _) => Phase::SpeciesSelected,
            (None, _, _, _) => Phase::Idle,
        }
    }

    /// 1-based position of the selected file and the number of files.
    pub fn file_position(&self) -> Option<(usize, usize)> {
        let file = self.file.as_ref()?;
        let pos = self.files.iter().position(|f| f == file)?;
        Some((pos + 1, self.files.len()))
    }
}

/// An opened file and the frame shown from it.
struct Loaded {
    video: VideoSource,
    frame: RgbFrame,
}

pub struct Browser<R = rand::rngs::ThreadRng> {
    root: PathBuf,
    species: Vec<String>,
    state: SessionState,
    video: Option<VideoSource>,
    frame: Option<RgbFrame>,
    rng: R,
}

impl Browser {
    /// Browse the tree under `root` (the `species/` directory).
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::with_rng(root, rand::rng())
    }
}

impl<R: Rng> Browser<R> {
    pub fn with_rng<P: AsRef<Path>>(root: P, rng: R) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let species = list_entries(&root)?;
        info!(root = %root.display(), species = species.len(), "opened species tree");
        Ok(Self {
            root,
            species,
            state: SessionState::default(),
            video: None,
            frame: None,
            rng,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn species(&self) -> &[String] {
        &self.species
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The frame matching the current selection, if one is positioned.
    pub fn frame(&self) -> Option<&RgbFrame> {
        self.frame.as_ref()
    }

    pub fn video(&self) -> Option<&VideoSource> {
        self.video.as_ref()
    }

    pub fn file_position(&self) -> Option<(usize, usize)> {
        self.state.file_position()
    }

    /// Path of the selected file.
    pub fn selected_path(&self) -> Option<PathBuf> {
        let s = &self.state;
        Some(
            self.root
                .join(s.species.as_ref()?)
                .join(s.date.as_ref()?)
                .join(s.file.as_ref()?),
        )
    }

    /// Apply `command` and return the effect the caller must perform.
    pub fn update(&mut self, command: Command) -> Result<Effect> {
        debug!(?command, "browser update");
        match command {
            Command::SelectSpecies(name) => self.select_species(name),
            Command::SelectDate(name) => self.select_date(name),
            Command::SelectFile(name) => self.select_file(name),
            Command::NavigateFile(direction) => self.navigate_file(direction),
            Command::JumpRandomFrame => self.jump_random_frame(),
            Command::SetFrame(index) => self.set_frame(index),
            Command::SaveFrame => Ok(if self.frame.is_some() {
                Effect::Save
            } else {
                Effect::None
            }),
        }
    }

    /// `update` plus the effect.  A failed save keeps the displayed frame so
    /// it can be retried.
    pub fn dispatch(&mut self, command: Command, store: &CuratedStore) -> Result<Outcome> {
        match self.update(command)? {
            Effect::None => Ok(Outcome::Unchanged),
            Effect::Redraw => Ok(Outcome::Redrawn),
            Effect::Save => match &self.frame {
                Some(frame) => Ok(Outcome::Saved {
                    id: store.save(frame)?,
                }),
                None => Ok(Outcome::Unchanged),
            },
        }
    }

    // ── Selection ────────────────────────────────────────────────────────────

    fn select_species(&mut self, name: String) -> Result<Effect> {
        require_listed("species", &self.species, &name)?;
        let dates = list_entries(&self.root.join(&name))?;
        let mut next = SessionState {
            species: Some(name),
            dates,
            ..SessionState::default()
        };
        let loaded = match next.dates.first().cloned() {
            Some(date) => self.resolve_date(&mut next, date)?,
            None => None,
        };
        self.commit(next, loaded);
        Ok(Effect::Redraw)
    }

    fn select_date(&mut self, name: String) -> Result<Effect> {
        require_listed("date", &self.state.dates, &name)?;
        let mut next = SessionState {
            species: self.state.species.clone(),
            dates: self.state.dates.clone(),
            ..SessionState::default()
        };
        let loaded = self.resolve_date(&mut next, name)?;
        self.commit(next, loaded);
        Ok(Effect::Redraw)
    }

    fn select_file(&mut self, name: String) -> Result<Effect> {
        require_listed("file", &self.state.files, &name)?;
        let mut next = self.state.clone();
        let loaded = self.resolve_file(&mut next, name)?;
        self.commit(next, Some(loaded));
        Ok(Effect::Redraw)
    }

    fn navigate_file(&mut self, direction: Direction) -> Result<Effect> {
        let Some((position, total)) = self.state.file_position() else {
            return Ok(Effect::None);
        };
        let target = match direction {
            Direction::Previous if position > 1 => position - 2,
            Direction::Next if position < total => position,
            _ => {
                debug!(?direction, position, total, "at list boundary");
                return Ok(Effect::None);
            }
        };
        let name = self.state.files[target].clone();
        self.select_file(name)
    }

    /// List the files of `date` into `next` and try to open the first one.
    /// A first file that cannot be opened stops the cascade at the date.
    fn resolve_date(&self, next: &mut SessionState, date: String) -> Result<Option<Loaded>> {
        let species = next.species.as_deref().unwrap_or_default();
        next.files = list_entries(&self.root.join(species).join(&date))?;
        next.date = Some(date);

        let Some(first) = next.files.first().cloned() else {
            return Ok(None);
        };
        let mut candidate = next.clone();
        match self.resolve_file(&mut candidate, first) {
            Ok(loaded) => {
                *next = candidate;
                Ok(Some(loaded))
            }
            Err(e) => {
                warn!(error = %e, "first file could not be shown; select another file");
                Ok(None)
            }
        }
    }

    fn resolve_file(&self, next: &mut SessionState, file: String) -> Result<Loaded> {
        let path = self
            .root
            .join(next.species.as_deref().unwrap_or_default())
            .join(next.date.as_deref().unwrap_or_default())
            .join(&file);

        let mut video = VideoSource::open(&path)?;
        let frame_count = video.frame_count();
        if frame_count == 0 {
            return Err(CurationError::video_open(&path, "contains no decodable frames"));
        }
        let middle = (frame_count - 1) / 2;
        let frame = video.get_frame(middle as i64)?;

        next.file = Some(file);
        next.frame_count = frame_count;
        next.frame_index = Some(middle);
        Ok(Loaded { video, frame })
    }

    fn commit(&mut self, next: SessionState, loaded: Option<Loaded>) {
        info!(
            species = ?next.species,
            date = ?next.date,
            file = ?next.file,
            frame = ?next.frame_index,
            "selection changed"
        );
        self.state = next;
        match loaded {
            Some(Loaded { video, frame }) => {
                self.video = Some(video);
                self.frame = Some(frame);
            }
            None => {
                self.video = None;
                self.frame = None;
            }
        }
    }

    // ── Frame positioning ────────────────────────────────────────────────────

    fn jump_random_frame(&mut self) -> Result<Effect> {
        if self.video.is_none() || self.state.frame_count == 0 {
            return Ok(Effect::None);
        }
        let index = self.rng.random_range(0..self.state.frame_count);
        self.set_frame(index as i64)
    }

    fn set_frame(&mut self, index: i64) -> Result<Effect> {
        let Some(video) = self.video.as_mut() else {
            return Err(CurationError::FrameIndexOutOfRange {
                index,
                frame_count: 0,
            });
        };
        let frame = video.get_frame(index)?;
        self.state.frame_index = Some(frame.index);
        self.frame = Some(frame);
        Ok(Effect::Redraw)
    }
}

fn require_listed(level: &'static str, entries: &[String], name: &str) -> Result<()> {
    if entries.iter().any(|e| e == name) {
        Ok(())
    } else {
        Err(CurationError::UnknownEntry {
            level,
            name: name.to_string(),
        })
    }
}

/// Immediate children of `dir`, sorted, without dot-files.
pub fn list_entries(dir: &Path) -> Result<Vec<String>> {
    let read = std::fs::read_dir(dir).map_err(|e| CurationError::listing(dir, e))?;
    let mut names = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| CurationError::listing(dir, e))?;
        match entry.file_name().into_string() {
            Ok(name) if name.starts_with('.') => {}
            Ok(name) => names.push(name),
            Err(raw) => warn!(dir = %dir.display(), name = ?raw, "skipping non-UTF-8 entry"),
        }
    }
    names.sort();
    Ok(names)
}
