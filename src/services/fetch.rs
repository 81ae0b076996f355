// Image reference resolution: http(s) URLs and explicit file:// URLs

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::errors::{FetchError, FetchResult};

pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];

/// Image fetch collaborator.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, reference: &str) -> FetchResult<Vec<u8>>;
}

pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("grape_leaf_workflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn download(&self, url: &str) -> FetchResult<Vec<u8>> {
        let response = self.client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(FetchError::NotAnImage(content_type));
        }

        let bytes = response.bytes()?;
        debug!("📥 Downloaded {} bytes ({})", bytes.len(), content_type);
        Ok(bytes.to_vec())
    }
}

/// Where an image reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Remote(String),
    Local(PathBuf),
}

/// Classify a reference by scheme. Only `http://`, `https://` and `file://`
/// are accepted; bare paths are refused so the API cannot read arbitrary
/// host files.
pub fn resolve_reference(reference: &str) -> FetchResult<ImageSource> {
    let Some((scheme, rest)) = reference.split_once("://") else {
        return Err(FetchError::UnsupportedScheme(reference.to_string()));
    };
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "https" => Ok(ImageSource::Remote(reference.to_string())),
        "file" if !rest.is_empty() => Ok(ImageSource::Local(PathBuf::from(rest))),
        _ => Err(FetchError::UnsupportedScheme(reference.to_string())),
    }
}

pub fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn read_local(path: &Path) -> FetchResult<Vec<u8>> {
    let display = path.display().to_string();
    if !path.is_file() {
        return Err(FetchError::NotFound(display));
    }
    if !has_allowed_extension(path) {
        return Err(FetchError::UnsupportedExtension(display));
    }
    std::fs::read(path).map_err(|source| FetchError::Io { path: display, source })
}

impl ImageFetcher for HttpImageFetcher {
    #[instrument(skip(self))]
    fn fetch(&self, reference: &str) -> FetchResult<Vec<u8>> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(FetchError::EmptyReference);
        }
        match resolve_reference(reference)? {
            ImageSource::Local(path) => read_local(&path),
            ImageSource::Remote(url) => self.download(&url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reference_resolution() {
        assert_eq!(
            resolve_reference("file:///tmp/leaf.jpg").unwrap(),
            ImageSource::Local(PathBuf::from("/tmp/leaf.jpg"))
        );
        assert_eq!(
            resolve_reference("FILE:///tmp/leaf.jpg").unwrap(),
            ImageSource::Local(PathBuf::from("/tmp/leaf.jpg"))
        );
        assert_eq!(
            resolve_reference("https://example.com/leaf.jpg").unwrap(),
            ImageSource::Remote("https://example.com/leaf.jpg".to_string())
        );
        assert!(matches!(
            resolve_reference("HTTP://example.com/leaf.jpg"),
            Ok(ImageSource::Remote(_))
        ));
    }

    #[test]
    fn test_bare_paths_and_other_schemes_are_refused() {
        for reference in ["images/leaf.png", "/etc/leaf.jpg", "ftp://host/leaf.jpg", "file://"] {
            assert!(
                matches!(resolve_reference(reference), Err(FetchError::UnsupportedScheme(_))),
                "{}",
                reference
            );
        }
    }

    #[test]
    fn test_extension_allow_list() {
        assert!(has_allowed_extension(Path::new("a/leaf.JPG")));
        assert!(has_allowed_extension(Path::new("leaf.bmp")));
        assert!(!has_allowed_extension(Path::new("leaf.tiff")));
        assert!(!has_allowed_extension(Path::new("leaf")));
    }

    #[test]
    fn test_fetch_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.png");
        std::fs::File::create(&path).unwrap().write_all(b"bytes").unwrap();

        let fetcher = HttpImageFetcher::new(Duration::from_secs(1)).unwrap();
        let bytes = fetcher.fetch(&format!("file://{}", path.display())).unwrap();
        assert_eq!(bytes, b"bytes");
    }

    #[test]
    fn test_fetch_rejects_bad_local_references() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"hello").unwrap();

        let fetcher = HttpImageFetcher::new(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            fetcher.fetch(&format!("file://{}", text.display())),
            Err(FetchError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            fetcher.fetch(&format!("file://{}", dir.path().join("missing.jpg").display())),
            Err(FetchError::NotFound(_))
        ));

        // the same existing image without the scheme is refused
        let image = dir.path().join("leaf.jpg");
        std::fs::write(&image, b"jpeg").unwrap();
        assert!(matches!(
            fetcher.fetch(image.to_str().unwrap()),
            Err(FetchError::UnsupportedScheme(_))
        ));
        assert!(matches!(fetcher.fetch("   "), Err(FetchError::EmptyReference)));
    }
}
