//! review — line-oriented review console over a `Browser`

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use aviary_core::{
    browser::{Browser, Command, Direction, Outcome},
    config::Config,
    detection::{Detector, SidecarDetector},
    persistence::CuratedStore,
    rendering::OverlayRenderer,
    species::Species,
};

const DEFAULT_PREVIEW: &str = "preview.png";

const HELP: &str = "\
commands:
  species NAME    select a species (cascades to its first date and file)
  date NAME       select a date of the current species
  file NAME       select a file of the current date
  prev | next     previous / next file
  random          jump to a random frame
  frame N         jump to frame N
  save            add the current frame to the curated dataset
  show [PATH]     write the current frame (with detections) to PATH
  status          print the current selection
  list            list species, dates and files
  help            this text
  quit            leave";

/// One parsed console line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Browse(Command),
    Show(Option<PathBuf>),
    Status,
    List,
    Help,
    Quit,
    Empty,
}

fn parse_line(line: &str) -> std::result::Result<Input, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let need_arg = |what: &str| {
        if rest.is_empty() {
            Err(format!("`{word}` needs a {what}"))
        } else {
            Ok(rest.to_string())
        }
    };

    let input = match word {
        "" => Input::Empty,
        "species" => Input::Browse(Command::SelectSpecies(need_arg("species name")?)),
        "date" => Input::Browse(Command::SelectDate(need_arg("date")?)),
        "file" => Input::Browse(Command::SelectFile(need_arg("file name")?)),
        "prev" | "previous" => Input::Browse(Command::NavigateFile(Direction::Previous)),
        "next" => Input::Browse(Command::NavigateFile(Direction::Next)),
        "random" => Input::Browse(Command::JumpRandomFrame),
        "frame" => {
            let n = need_arg("frame number")?;
            let index = n
                .parse::<i64>()
                .map_err(|_| format!("{n:?} is not a frame number"))?;
            Input::Browse(Command::SetFrame(index))
        }
        "save" => Input::Browse(Command::SaveFrame),
        "show" => Input::Show((!rest.is_empty()).then(|| PathBuf::from(rest))),
        "status" => Input::Status,
        "list" | "ls" => Input::List,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => return Err(format!("unknown command {other:?}; try `help`")),
    };
    Ok(input)
}

struct Session {
    browser: Browser,
    store: CuratedStore,
    renderer: OverlayRenderer,
    detector: Option<SidecarDetector>,
}

pub fn run(config: &Config, detections: Option<&Path>) -> Result<()> {
    let browser = Browser::open(&config.species_root).with_context(|| {
        format!(
            "failed to open species tree: {}",
            config.species_root.display()
        )
    })?;
    let store = CuratedStore::open(&config.dataset_dir, &config.index_file)
        .context("failed to open curated dataset")?;
    let renderer = OverlayRenderer::new(config.render_config())?;
    let detector = detections.map(SidecarDetector::load).transpose()?;
    if let Some(d) = &detector {
        info!(frames = d.frames_with_detections(), "loaded detection sidecar");
    }

    let mut session = Session {
        browser,
        store,
        renderer,
        detector,
    };

    // Match the old dashboard: start on the first species.
    if let Some(first) = session.browser.species().first().cloned() {
        session.apply(Command::SelectSpecies(first));
    }
    println!("species tree: {}", session.browser.root().display());
    println!("saving to   : {}", session.store.dir().display());
    session.print_status();
    println!("type `help` for commands");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("aviary> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        match parse_line(&line?) {
            Ok(Input::Quit) => break,
            Ok(input) => session.handle(input),
            Err(msg) => println!("{msg}"),
        }
    }
    Ok(())
}

impl Session {
    fn handle(&mut self, input: Input) {
        match input {
            Input::Browse(command) => self.apply(command),
            Input::Show(path) => {
                let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_PREVIEW));
                if let Err(e) = self.show(&path) {
                    println!("error: {e:#}");
                }
            }
            Input::Status => self.print_status(),
            Input::List => self.print_listing(),
            Input::Help => println!("{HELP}"),
            Input::Quit | Input::Empty => {}
        }
    }

    fn apply(&mut self, command: Command) {
        match self.browser.dispatch(command, &self.store) {
            Ok(Outcome::Saved { id }) => println!("saved {}", self.store.image_path(id).display()),
            Ok(Outcome::Redrawn) => self.print_status(),
            Ok(Outcome::Unchanged) => println!("(unchanged)"),
            Err(e) if e.is_user_visible() => {
                warn!(error = %e, "command failed");
                println!("error: {e} (previous frame kept)");
            }
            Err(e) => println!("error: {e}"),
        }
    }

    fn show(&mut self, path: &Path) -> Result<()> {
        let Some(frame) = self.browser.frame() else {
            println!("no frame selected");
            return Ok(());
        };
        let frame = match self.detector.as_mut() {
            Some(detector) => {
                let found = detector.detect(frame)?;
                self.renderer.render(frame, &found)?
            }
            None => frame.clone(),
        };
        frame
            .to_image()?
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {}", path.display());
        Ok(())
    }

    fn print_status(&self) {
        let s = self.browser.state();
        let show = |v: &Option<String>| v.as_deref().unwrap_or("-").to_string();
        println!("species : {}", species_caption(s.species.as_deref()));
        println!("date    : {}", show(&s.date));
        match self.browser.file_position() {
            Some((i, n)) => println!("file    : {} (file {i} of {n})", show(&s.file)),
            None => println!("file    : -"),
        }
        match s.frame_index {
            Some(i) => println!("frame   : {i} / {}", s.frame_count.saturating_sub(1)),
            None => println!("frame   : -"),
        }
        if let Some(path) = self.browser.selected_path() {
            println!("path    : {}", path.display());
        }
    }

    fn print_listing(&self) {
        let s = self.browser.state();
        println!("species : {}", self.browser.species().join(", "));
        println!("dates   : {}", s.dates.join(", "));
        println!("files   : {}", s.files.join(", "));
    }
}

/// Directory name plus the common name when it is a known species label.
fn species_caption(dir: Option<&str>) -> String {
    match dir {
        Some(dir) => match dir.parse::<Species>() {
            Ok(species) => format!("{dir} ({})", species.name()),
            Err(_) => dir.to_string(),
        },
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browse_commands() {
        assert_eq!(
            parse_line("species chupim").unwrap(),
            Input::Browse(Command::SelectSpecies("chupim".into()))
        );
        assert_eq!(
            parse_line("  file 7-3-2022 14-5-9.avi ").unwrap(),
            Input::Browse(Command::SelectFile("7-3-2022 14-5-9.avi".into()))
        );
        assert_eq!(
            parse_line("prev").unwrap(),
            Input::Browse(Command::NavigateFile(Direction::Previous))
        );
        assert_eq!(
            parse_line("frame -1").unwrap(),
            Input::Browse(Command::SetFrame(-1))
        );
        assert_eq!(parse_line("save").unwrap(), Input::Browse(Command::SaveFrame));
    }

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_line("").unwrap(), Input::Empty);
        assert_eq!(parse_line("show").unwrap(), Input::Show(None));
        assert_eq!(
            parse_line("show out/a.png").unwrap(),
            Input::Show(Some(PathBuf::from("out/a.png")))
        );
        assert_eq!(parse_line("q").unwrap(), Input::Quit);
    }

    #[test]
    fn species_caption_shows_the_common_name() {
        assert_eq!(species_caption(Some("chupim")), "chupim (Chupim)");
        assert_eq!(
            species_caption(Some("canario_do_amazonas")),
            "canario_do_amazonas (Canário-do-amazonas)"
        );
        assert_eq!(species_caption(Some("passaros_novos")), "passaros_novos");
        assert_eq!(species_caption(None), "-");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_line("species").is_err());
        assert!(parse_line("frame ten").is_err());
        assert!(parse_line("dance").is_err());
    }
}
