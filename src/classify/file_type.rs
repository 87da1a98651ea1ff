use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use super::is_container_path;
use crate::error::ConfigurationError;

/// Broad content category of a file, decided by its extension.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Code,
    Font,
    Executable,
    Model,
}

impl FileType {
    pub const ALL: [FileType; 10] = [
        FileType::Text,
        FileType::Image,
        FileType::Video,
        FileType::Audio,
        FileType::Document,
        FileType::Archive,
        FileType::Code,
        FileType::Font,
        FileType::Executable,
        FileType::Model,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Text => "text",
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Audio => "audio",
            FileType::Document => "document",
            FileType::Archive => "archive",
            FileType::Code => "code",
            FileType::Font => "font",
            FileType::Executable => "executable",
            FileType::Model => "model",
        }
    }

    /// Lowercase extensions without the dot. Archives are matched by
    /// [`is_container_path`] first so multi-part suffixes like `.tar.zst` count.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            FileType::Text => &[
                "txt", "md", "log", "ini", "cfg", "conf", "json", "xml", "yml", "yaml", "csv",
            ],
            FileType::Image => &[
                "jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "svg", "ico", "raw", "jxl",
                "avif", "psd",
            ],
            FileType::Video => &[
                "mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg",
            ],
            FileType::Audio => &["mp3", "wav", "ogg", "flac", "aac", "wma", "m4a", "opus"],
            FileType::Document => &[
                "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp",
            ],
            FileType::Archive => &["iso"],
            FileType::Code => &[
                "py", "js", "html", "css", "java", "c", "cpp", "cs", "php", "go", "rs", "rb", "ts",
            ],
            FileType::Font => &["ttf", "otf", "woff", "woff2", "eot"],
            FileType::Executable => &["exe", "dll", "bat", "sh", "msi", "app", "apk"],
            FileType::Model => &[
                "pth", "h5", "pb", "onnx", "tflite", "mlmodel", "pt", "bin", "caffemodel",
            ],
        }
    }

    /// Category of `path`, or `None` for unknown extensions.
    pub fn of(path: &Path) -> Option<FileType> {
        if is_container_path(path) {
            return Some(FileType::Archive);
        }
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        FileType::ALL
            .into_iter()
            .find(|t| t.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FileType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ConfigurationError::UnknownFileType(s.to_string()))
    }
}
