//! On-disk layout of a project.
//!
//! ```text
//! output/{YYYYmmdd_HHMMSS}_{slug}/
//!     manifest.json
//!     1_scripts/{slug}_scenes.json
//!     2_audio/scene_01_audio.mp3
//!     images/{slug}/scene_01_var_01.png
//!     video/clips/{slug}/scene_01.mp4
//!     video/final/{slug}/scene_01_final.mp4
//!     video/complete/{slug}_complete.mp4
//! ```
//!
//! Every file name carries a zero-padded scene id. Lexical order stops
//! matching numeric order past 99 scenes, so anything that lists assets
//! sorts by the parsed id instead.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use types::{ProjectScenes, SceneId, SchemaError, parse_scene_file, slugify};

use crate::StageError;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCRIPTS_DIR: &str = "1_scripts";
pub const AUDIO_DIR: &str = "2_audio";

const PROJECT_ID_FORMAT: &str = "%Y%m%d_%H%M%S";
// "20250101_120000_"
const PROJECT_ID_PREFIX_LEN: usize = 16;

/// Which per-scene artifact a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Audio,
    Image { variation: u32 },
    Clip,
    FinalClip,
}

impl AssetKind {
    pub fn file_name(self, scene_id: SceneId) -> String {
        match self {
            Self::Audio => format!("scene_{scene_id:02}_audio.mp3"),
            Self::Image { variation } => {
                format!("scene_{scene_id:02}_var_{variation:02}.png")
            }
            Self::Clip => format!("scene_{scene_id:02}.mp4"),
            Self::FinalClip => format!("scene_{scene_id:02}_final.mp4"),
        }
    }
}

/// Path builder for one project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPaths {
    root: PathBuf,
    slug: String,
}

impl AssetPaths {
    pub fn new(root: impl Into<PathBuf>, slug: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            slug: slug.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(SCRIPTS_DIR)
    }

    pub fn scenes_file(&self) -> PathBuf {
        self.scripts_dir().join(format!("{}_scenes.json", self.slug))
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join(AUDIO_DIR)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images").join(&self.slug)
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.root.join("video").join("clips").join(&self.slug)
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root.join("video").join("final").join(&self.slug)
    }

    pub fn complete_dir(&self) -> PathBuf {
        self.root.join("video").join("complete")
    }

    pub fn complete_file(&self) -> PathBuf {
        self.complete_dir()
            .join(format!("{}_complete.mp4", self.slug))
    }

    pub fn asset(&self, kind: AssetKind, scene_id: SceneId) -> PathBuf {
        let dir = match kind {
            AssetKind::Audio => self.audio_dir(),
            AssetKind::Image { .. } => self.images_dir(),
            AssetKind::Clip => self.clips_dir(),
            AssetKind::FinalClip => self.final_dir(),
        };
        dir.join(kind.file_name(scene_id))
    }
}

/// What the script stage recorded about how the project was generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSummary {
    pub text_model: Option<String>,
    pub voice: Option<String>,
    pub scenes_generated: usize,
    pub audio_files_generated: Option<usize>,
    pub fallback_used: bool,
    pub script_seconds: f64,
    pub audio_seconds: Option<f64>,
}

/// `manifest.json`: written once by the script stage, read by the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub project_id: String,
    pub topic: String,
    pub topic_slug: String,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub generation: GenerationSummary,

    #[serde(skip)]
    root: PathBuf,
}

impl ProjectManifest {
    /// Start a new project under `output_base` and create its directory.
    ///
    /// # Errors
    /// `Manifest` if a project with the same id already exists, `Io` if the
    /// directories cannot be created.
    pub async fn create(
        output_base: &Path,
        topic: &str,
        now: NaiveDateTime,
    ) -> Result<Self, StageError> {
        let topic_slug = slugify(topic).map_err(SchemaError::from)?;
        let project_id = format!("{}_{topic_slug}", now.format(PROJECT_ID_FORMAT));
        let root = output_base.join(&project_id);

        if tokio::fs::try_exists(&root).await.map_err(StageError::io(&root))? {
            return Err(StageError::Manifest(format!(
                "project directory {} already exists",
                root.display()
            )));
        }

        let manifest = Self {
            project_id,
            topic: topic.to_string(),
            topic_slug,
            created_at: now,
            generation: GenerationSummary::default(),
            root,
        };

        let scripts = manifest.paths().scripts_dir();
        tokio::fs::create_dir_all(&scripts)
            .await
            .map_err(StageError::io(&scripts))?;

        tracing::info!(project = %manifest.project_id, "created project");
        Ok(manifest)
    }

    /// Read the manifest of the project at `root`.
    ///
    /// Directories created before manifests existed are still accepted: the
    /// id, slug and creation time are recovered from the directory name.
    ///
    /// # Errors
    /// `Manifest` if neither the file nor the directory name can be read.
    pub async fn load(root: &Path) -> Result<Self, StageError> {
        let file = root.join(MANIFEST_FILE);
        match tokio::fs::read_to_string(&file).await {
            Ok(contents) => {
                let mut manifest: Self = serde_json::from_str(&contents)?;
                manifest.root = root.to_path_buf();
                Ok(manifest)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no manifest in {}, using directory name", root.display());
                Self::from_directory_name(root)
            }
            Err(err) => Err(StageError::io(&file)(err)),
        }
    }

    fn from_directory_name(root: &Path) -> Result<Self, StageError> {
        let project_id = root
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                StageError::Manifest(format!("{} is not a project directory", root.display()))
            })?;

        let (created_at, topic_slug) = parse_project_id(project_id).ok_or_else(|| {
            StageError::Manifest(format!(
                "{project_id} does not look like a project id (YYYYmmdd_HHMMSS_slug)"
            ))
        })?;

        Ok(Self {
            project_id: project_id.to_string(),
            topic: topic_slug.clone(),
            topic_slug,
            created_at,
            generation: GenerationSummary::default(),
            root: root.to_path_buf(),
        })
    }

    /// Find the newest project for `topic` under `output_base`.
    ///
    /// `topic` may be the display text or the slug.
    ///
    /// # Errors
    /// `Manifest` if no project matches.
    pub async fn discover(output_base: &Path, topic: &str) -> Result<Self, StageError> {
        let slug = slugify(topic).map_err(SchemaError::from)?;

        let mut entries = tokio::fs::read_dir(output_base)
            .await
            .map_err(StageError::io(output_base))?;

        let mut newest: Option<(NaiveDateTime, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StageError::io(output_base))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some((created_at, entry_slug)) = parse_project_id(&name) else {
                continue;
            };
            if entry_slug != slug || !entry.path().is_dir() {
                continue;
            }
            if newest.as_ref().is_none_or(|(seen, _)| created_at > *seen) {
                newest = Some((created_at, entry.path()));
            }
        }

        let (_, root) = newest.ok_or_else(|| {
            StageError::Manifest(format!(
                "no project for topic '{slug}' in {}",
                output_base.display()
            ))
        })?;

        tracing::info!("using project {}", root.display());
        Self::load(&root).await
    }

    /// Project owning a scenes file at `{root}/1_scripts/{slug}_scenes.json`.
    ///
    /// # Errors
    /// `MissingInput` if the file does not exist, `Manifest` if it is not
    /// inside a project's scripts directory.
    pub async fn from_scenes_file(path: &Path) -> Result<Self, StageError> {
        if !tokio::fs::try_exists(path).await.map_err(StageError::io(path))? {
            return Err(StageError::MissingInput {
                path: path.to_path_buf(),
            });
        }

        let root = path
            .parent()
            .filter(|dir| dir.file_name().is_some_and(|name| name == SCRIPTS_DIR))
            .and_then(Path::parent)
            .ok_or_else(|| {
                StageError::Manifest(format!(
                    "{} is not inside a project's {SCRIPTS_DIR} directory",
                    path.display()
                ))
            })?;

        let manifest = Self::load(root).await?;
        if manifest.paths().scenes_file() != path {
            tracing::warn!(
                "scenes file {} does not follow the project naming, expected {}",
                path.display(),
                manifest.paths().scenes_file().display()
            );
        }
        Ok(manifest)
    }

    /// Resolve the project a stage was pointed at.
    ///
    /// # Errors
    /// Any error from `from_scenes_file` or `discover`.
    pub async fn resolve(args: &crate::cli::ProjectArgs) -> Result<Self, StageError> {
        match (&args.source.input, &args.source.topic) {
            (Some(input), _) => Self::from_scenes_file(input).await,
            (None, Some(topic)) => Self::discover(&args.output, topic).await,
            (None, None) => Err(StageError::Manifest(
                "either a topic or an input file is required".to_string(),
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> AssetPaths {
        AssetPaths::new(&self.root, &self.topic_slug)
    }

    /// # Errors
    /// `Io` if the file cannot be written.
    pub async fn save(&self) -> Result<(), StageError> {
        let file = self.paths().manifest_file();
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&file, contents)
            .await
            .map_err(StageError::io(&file))
    }

    /// Read and validate the project's scenes file.
    ///
    /// # Errors
    /// `MissingInput` if the file does not exist, `Schema` if it does not
    /// validate.
    pub async fn load_scenes(&self) -> Result<ProjectScenes, StageError> {
        let file = self.paths().scenes_file();
        let contents = match tokio::fs::read_to_string(&file).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StageError::MissingInput { path: file });
            }
            Err(err) => return Err(StageError::io(&file)(err)),
        };

        Ok(parse_scene_file(&contents, &self.topic)?)
    }
}

fn parse_project_id(project_id: &str) -> Option<(NaiveDateTime, String)> {
    let timestamp = project_id.get(..PROJECT_ID_PREFIX_LEN - 1)?;
    let slug = project_id.get(PROJECT_ID_PREFIX_LEN..)?;
    if project_id.as_bytes().get(PROJECT_ID_PREFIX_LEN - 1) != Some(&b'_') || slug.is_empty() {
        return None;
    }
    let created_at = NaiveDateTime::parse_from_str(timestamp, PROJECT_ID_FORMAT).ok()?;
    Some((created_at, slug.to_string()))
}

/// Scene id embedded in an asset file name: `scene_07_final.mp4` is 7.
pub fn scene_id_from_file_name(name: &str) -> Option<SceneId> {
    let rest = &name[name.find("scene")? + "scene".len()..];
    let rest = rest.strip_prefix(['_', '-']).unwrap_or(rest);
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Files in `dir` named `scene_*{suffix}`, ordered by scene id, then file
/// name. A scene may have several, e.g. image variations.
///
/// # Errors
/// `Io` if the directory cannot be read.
pub async fn list_scene_files(
    dir: &Path,
    suffix: &str,
) -> Result<Vec<(SceneId, PathBuf)>, StageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StageError::io(dir)(err)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StageError::io(dir))? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with("scene") || !name.ends_with(suffix) {
            continue;
        }
        match scene_id_from_file_name(name) {
            Some(scene_id) => files.push((scene_id, entry.path())),
            None => tracing::warn!("ignoring {name}: no scene id in file name"),
        }
    }

    files.sort();
    Ok(files)
}

/// Like `list_scene_files`, for assets that exist once per scene.
///
/// `scene_1_final.mp4` and `scene_01_final.mp4` name the same scene; only
/// the first by file name is kept, which puts the zero-padded name first.
///
/// # Errors
/// `Io` if the directory cannot be read.
pub async fn list_unique_scene_files(
    dir: &Path,
    suffix: &str,
) -> Result<Vec<(SceneId, PathBuf)>, StageError> {
    let mut unique: Vec<(SceneId, PathBuf)> = Vec::new();
    for (scene_id, path) in list_scene_files(dir, suffix).await? {
        if let Some((_, kept)) = unique.last().filter(|(last_id, _)| *last_id == scene_id) {
            tracing::warn!(
                scene = scene_id,
                "ignoring {}: scene already provided by {}",
                path.display(),
                kept.display()
            );
            continue;
        }
        unique.push((scene_id, path));
    }
    Ok(unique)
}
