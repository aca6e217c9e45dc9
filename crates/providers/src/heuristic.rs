use crate::{
    Acceleration, BatchOutcome, EngineOptions, InferenceEngine, InferenceError, InferenceInput,
    InferenceRuntime, ModelLoadError, Suggestion,
};
use std::collections::HashMap;
use std::path::PathBuf;

const LARGE_FILE_BYTES: u64 = 1024 * 1024 * 1024;
const SMALL_FILE_BYTES: u64 = 100 * 1024;
const SMALL_VIDEO_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct HeuristicRuntime;

#[async_trait::async_trait]
impl InferenceRuntime for HeuristicRuntime {
    async fn initialize(
        &self,
        options: &EngineOptions,
    ) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
        if options.acceleration == Acceleration::Gpu {
            return Err(ModelLoadError::AccelerationUnavailable(Acceleration::Gpu));
        }
        let overrides = match &options.model_path {
            Some(path) => load_overrides(path).await?,
            None => HashMap::new(),
        };
        Ok(Box::new(HeuristicEngine {
            overrides,
            confidence_threshold: options.confidence_threshold,
        }))
    }
}

/// The "model" is an optional JSON object of `extension -> Family/Category`.
async fn load_overrides(path: &PathBuf) -> Result<HashMap<String, String>, ModelLoadError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|_| ModelLoadError::NotFound(path.clone()))?;
    let parsed: HashMap<String, String> =
        serde_json::from_str(&raw).map_err(|e| ModelLoadError::Invalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    tracing::debug!(path = %path.display(), entries = parsed.len(), "loaded category overrides");
    Ok(parsed
        .into_iter()
        .map(|(ext, category)| (ext.trim_start_matches('.').to_lowercase(), category))
        .collect())
}

pub struct HeuristicEngine {
    overrides: HashMap<String, String>,
    confidence_threshold: f32,
}

#[async_trait::async_trait]
impl InferenceEngine for HeuristicEngine {
    async fn infer(&mut self, batch: &[InferenceInput<'_>]) -> BatchOutcome {
        Ok(batch.iter().map(|input| self.categorize(input)).collect())
    }
}

struct Verdict {
    family: &'static str,
    category: String,
    subcategory: Option<&'static str>,
    confidence: f32,
    tags: Vec<&'static str>,
}

impl HeuristicEngine {
    fn categorize(&self, input: &InferenceInput<'_>) -> Result<Suggestion, InferenceError> {
        let name = input.file_name();
        if name.is_empty() {
            return Err(InferenceError::InvalidInput(format!(
                "no file name in {}",
                input.path.display()
            )));
        }
        let ext = input.extension.trim_start_matches('.').to_lowercase();
        let lower = name.to_lowercase();

        let verdict = match self.overrides.get(&ext) {
            Some(category) => Verdict {
                family: "Custom",
                category: category.clone(),
                subcategory: None,
                confidence: 0.9,
                tags: vec!["custom"],
            },
            None => builtin_verdict(&ext, &lower, input.size_bytes),
        };

        let mut suggested = PathBuf::from(verdict.family);
        suggested.push(&verdict.category);
        if let Some(sub) = verdict.subcategory {
            suggested.push(sub);
        }
        suggested.push(&name);

        let mut tags: Vec<String> = verdict.tags.iter().map(|t| t.to_string()).collect();
        if input.size_bytes > LARGE_FILE_BYTES {
            tags.push("large_file".into());
        } else if input.size_bytes < SMALL_FILE_BYTES {
            tags.push("small_file".into());
        }
        if verdict.confidence >= self.confidence_threshold {
            tags.push("high_confidence".into());
        } else {
            tags.push("low_confidence".into());
        }

        Ok(Suggestion {
            suggested_path: suggested,
            confidence: verdict.confidence,
            tags,
        })
    }
}

fn any_of(name: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| name.contains(p))
}

fn builtin_verdict(ext: &str, name: &str, size: u64) -> Verdict {
    let verdict = |family, category: &str, sub, confidence, tags: &[&'static str]| Verdict {
        family,
        category: category.to_string(),
        subcategory: Some(sub),
        confidence,
        tags: tags.to_vec(),
    };

    match ext {
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "tiff" | "webp" | "svg" | "ico" | "heic" => {
            if any_of(name, &["screenshot", "screen", "capture", "scr_"]) {
                verdict("Media", "Images", "Screenshots", 0.95, &["image", "screenshot"])
            } else if any_of(name, &["photo", "pic", "img_", "dsc_"]) {
                verdict("Media", "Images", "Photos", 0.9, &["image", "photo"])
            } else if any_of(name, &["wallpaper", "background", "desktop"]) {
                verdict("Media", "Images", "Wallpapers", 0.9, &["image", "wallpaper"])
            } else if any_of(name, &["logo", "icon", "graphic", "design"]) {
                verdict("Media", "Images", "Graphics", 0.85, &["image", "graphic"])
            } else {
                verdict("Media", "Images", "General", 0.8, &["image"])
            }
        }
        "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" | "m4v" => {
            if any_of(name, &["s01e", "s02e", "s03e", "season", "episode"]) {
                verdict("Media", "Videos", "TV Shows", 0.95, &["video", "series"])
            } else if any_of(name, &["movie", "film", "1080p", "720p", "4k", "bluray"]) {
                verdict("Media", "Videos", "Movies", 0.9, &["video", "movie"])
            } else if any_of(name, &["tutorial", "howto", "guide", "lesson"]) {
                verdict("Media", "Videos", "Tutorials", 0.9, &["video", "tutorial"])
            } else if size < SMALL_VIDEO_BYTES {
                verdict("Media", "Videos", "Recordings", 0.8, &["video", "recording"])
            } else {
                verdict("Media", "Videos", "General", 0.8, &["video"])
            }
        }
        "mp3" | "wav" | "flac" | "aac" | "ogg" | "wma" | "m4a" => {
            if any_of(name, &["podcast", "episode", "interview"]) {
                verdict("Media", "Audio", "Podcasts", 0.9, &["audio", "podcast"])
            } else if any_of(name, &["audiobook", "chapter"]) {
                verdict("Media", "Audio", "Audiobooks", 0.9, &["audio", "audiobook"])
            } else if any_of(name, &["sfx", "effect", "sample"]) {
                verdict("Media", "Audio", "Sound Effects", 0.85, &["audio", "sample"])
            } else {
                verdict("Media", "Audio", "Music", 0.8, &["audio", "music"])
            }
        }
        "pdf" | "doc" | "docx" | "txt" | "md" | "rtf" | "odt" => {
            if any_of(name, &["manual", "guide", "instruction", "handbook"]) {
                verdict("Documents", "Text", "Manuals", 0.9, &["document", "manual"])
            } else if any_of(name, &["report", "analysis", "summary", "review"]) {
                verdict("Documents", "Text", "Reports", 0.85, &["document", "report"])
            } else if any_of(name, &["book", "novel", "ebook"]) {
                verdict("Documents", "Text", "Books", 0.9, &["document", "book"])
            } else {
                verdict("Documents", "Text", "General", 0.8, &["document"])
            }
        }
        "xls" | "xlsx" | "csv" | "ods" => {
            verdict("Documents", "Spreadsheets", "General", 0.85, &["document", "spreadsheet"])
        }
        "ppt" | "pptx" | "odp" | "key" => {
            verdict("Documents", "Presentations", "General", 0.85, &["document", "slides"])
        }
        "rs" | "py" | "js" | "ts" | "html" | "css" | "cpp" | "java" | "c" | "h" | "go" | "rb" => {
            if any_of(name, &["script", "tool", "util", "automation"]) {
                verdict("Development", "Code", "Scripts", 0.85, &["code", "script"])
            } else {
                verdict("Development", "Code", "General", 0.8, &["code"])
            }
        }
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "xz" => {
            if any_of(name, &["backup", "bak", "archive"]) {
                verdict("Archives", "Compressed", "Backups", 0.9, &["archive", "backup"])
            } else if any_of(name, &["setup", "installer", "install"]) {
                verdict("Archives", "Compressed", "Software", 0.85, &["archive", "installer"])
            } else {
                verdict("Archives", "Compressed", "General", 0.8, &["archive"])
            }
        }
        _ => verdict("Miscellaneous", "Unknown", "Unclassified", 0.3, &["unknown"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn options(model_path: Option<PathBuf>, acceleration: Acceleration) -> EngineOptions {
        EngineOptions {
            model_path,
            acceleration,
            confidence_threshold: 0.7,
        }
    }

    fn input<'a>(path: &'a Path, ext: &'a str, size: u64) -> InferenceInput<'a> {
        InferenceInput {
            path,
            relative_path: path,
            extension: ext,
            size_bytes: size,
        }
    }

    #[tokio::test]
    async fn gpu_request_is_rejected() {
        let err = HeuristicRuntime
            .initialize(&options(None, Acceleration::Gpu))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::AccelerationUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_model_file_is_a_load_error() {
        let err = HeuristicRuntime
            .initialize(&options(
                Some(PathBuf::from("/definitely/not/here.json")),
                Acceleration::Cpu,
            ))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::NotFound(_)));
    }

    #[tokio::test]
    async fn categorizes_screenshots_and_unknowns() {
        let mut engine = HeuristicRuntime
            .initialize(&options(None, Acceleration::Cpu))
            .await
            .unwrap();
        let shot = Path::new("/home/u/Screenshot 2024.png");
        let blob = Path::new("/home/u/data.bin");
        let out = engine
            .infer(&[input(shot, "png", 2048), input(blob, "bin", 10)])
            .await
            .unwrap();

        let first = out[0].as_ref().unwrap();
        assert_eq!(
            first.suggested_path,
            PathBuf::from("Media/Images/Screenshots/Screenshot 2024.png")
        );
        assert!(first.tags.contains(&"high_confidence".to_string()));

        let second = out[1].as_ref().unwrap();
        assert!(second.confidence < 0.5);
        assert!(second.tags.contains(&"low_confidence".to_string()));
    }

    #[tokio::test]
    async fn overrides_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.json");
        std::fs::write(&model, r#"{".bin": "Firmware"}"#).unwrap();

        let mut engine = HeuristicRuntime
            .initialize(&options(Some(model), Acceleration::Cpu))
            .await
            .unwrap();
        let blob = Path::new("/x/router.bin");
        let out = engine.infer(&[input(blob, "bin", 10)]).await.unwrap();
        assert_eq!(
            out[0].as_ref().unwrap().suggested_path,
            PathBuf::from("Custom/Firmware/router.bin")
        );
    }
}
