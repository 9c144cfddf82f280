//! config — optional `aviary.toml` with every field defaulted
//!
//! ```toml
//! species_root = "species"
//! dataset_dir = "local_dataset"
//! index_file = "index.txt"
//!
//! [render]
//! font_scale = 0.6
//! box_thickness = 4
//!
//! [color_overrides]
//! chupim = "#b04a50"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{CurationError, Result};
use crate::rendering::RenderConfig;

pub const CONFIG_FILE_NAME: &str = "aviary.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the `{species}/{date}/{file}` recording tree.
    pub species_root: PathBuf,
    pub dataset_dir: PathBuf,
    /// Index file name, relative to `dataset_dir`.
    pub index_file: String,
    pub render: RenderConfig,
    /// Label → `#rrggbb`, applied on top of `render.colors`.
    pub color_overrides: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            species_root: PathBuf::from("species"),
            dataset_dir: PathBuf::from("local_dataset"),
            index_file: "index.txt".to_string(),
            render: RenderConfig::default(),
            color_overrides: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| CurationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CurationError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)
            .map_err(|e| CurationError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load `explicit` if given, else the nearest `aviary.toml` from the
    /// working directory upwards, else the defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let found = std::env::current_dir()
            .ok()
            .and_then(|cwd| discover(&cwd));
        match found {
            Some(path) => Self::load(path),
            None => {
                debug!("no {CONFIG_FILE_NAME} found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// The renderer settings with `color_overrides` folded in.
    pub fn render_config(&self) -> RenderConfig {
        let mut render = self.render.clone();
        render.colors.extend(
            self.color_overrides
                .iter()
                .map(|(label, hex)| (label.clone(), hex.clone())),
        );
        render
    }

    pub fn index_path(&self) -> PathBuf {
        self.dataset_dir.join(&self.index_file)
    }

    fn validate(&self) -> Result<()> {
        if self.index_file.is_empty()
            || self.index_file.contains(['/', '\\'])
            || self.index_file.starts_with('.')
        {
            return Err(CurationError::Config(format!(
                "index_file must be a plain file name, got {:?}",
                self.index_file
            )));
        }
        let r = &self.render;
        if !(r.font_scale > 0.0 && r.glyph_height_px > 0.0) {
            return Err(CurationError::Config(
                "render.font_scale and render.glyph_height_px must be positive".into(),
            ));
        }
        if r.box_thickness == 0 {
            return Err(CurationError::Config("render.box_thickness must be at least 1".into()));
        }
        Ok(())
    }
}

/// Nearest `aviary.toml` in `start` or one of its ancestors.
pub fn discover(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.index_path(), Path::new("local_dataset/index.txt"));
        assert_eq!(config.render.font_scale, 0.6);
        assert_eq!(config.render.box_thickness, 4);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = Config::from_toml(
            r##"
            dataset_dir = "/data/curated"

            [render]
            box_thickness = 2

            [color_overrides]
            chupim = "#00ff00"
            "##,
        )
        .unwrap();
        assert_eq!(config.dataset_dir, Path::new("/data/curated"));
        assert_eq!(config.species_root, Path::new("species"));
        assert_eq!(config.render.box_thickness, 2);
        assert_eq!(config.render.text_offset, 5);

        let render = config.render_config();
        assert_eq!(render.colors.get("chupim").map(String::as_str), Some("#00ff00"));
    }

    #[test]
    fn overrides_win_over_render_colors() {
        let config = Config::from_toml(
            r##"
            [render.colors]
            rolinha = "#111111"
            chupim = "#222222"

            [color_overrides]
            chupim = "#333333"
            "##,
        )
        .unwrap();
        let colors = config.render_config().colors;
        assert_eq!(colors["rolinha"], "#111111");
        assert_eq!(colors["chupim"], "#333333");
    }

    #[test]
    fn invalid_files_are_config_errors() {
        for bad in [
            "species_rot = \"typo\"",
            "index_file = \"../index.txt\"",
            "[render]\nbox_thickness = 0",
            "[render]\nfont_scale = -1.0",
            "dataset_dir = 3",
        ] {
            assert!(
                matches!(Config::from_toml(bad), Err(CurationError::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn discover_walks_up_to_the_nearest_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(discover(&nested), None);

        std::fs::write(dir.path().join("a").join(CONFIG_FILE_NAME), "").unwrap();
        assert_eq!(discover(&nested), Some(dir.path().join("a").join(CONFIG_FILE_NAME)));

        let config = Config::load(dir.path().join("a").join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, Config::default());
    }
}
