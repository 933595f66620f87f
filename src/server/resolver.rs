//! Request path to file resolution
//!
//! The first segment of the request path selects the transfer mode; the
//! whole path, relative to the document root, names the file. Paths with no
//! dot get the configured extension appended, so `/static/foo` is served
//! from `<root>/static/foo.dat`.

use crate::config::Config;
use log::debug;
use std::fs::File;
use std::path::{Path, PathBuf};

/// How a resource is sent to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Zero-copy `sendfile`
    Static,
    /// Chunked read/write through kernel AIO
    Dynamic,
    /// No resource; a 404 head is sent and nothing else
    NotFound,
}

/// Outcome of mapping a request path onto the document root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub mode: TransferMode,
    /// Set whenever `mode` is not `NotFound`
    pub path: Option<PathBuf>,
}

impl Resolution {
    fn not_found() -> Self {
        Resolution {
            mode: TransferMode::NotFound,
            path: None,
        }
    }
}

/// A resolved resource, opened read-only
#[derive(Debug)]
pub struct Resource {
    pub mode: TransferMode,
    pub file: Option<File>,
}

/// Maps request paths to files under a document root
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    static_folder: String,
    dynamic_folder: String,
    extension: String,
}

impl PathResolver {
    /// Create a resolver
    pub fn new(
        root: impl Into<PathBuf>,
        static_folder: impl Into<String>,
        dynamic_folder: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        PathResolver {
            root: root.into(),
            static_folder: static_folder.into(),
            dynamic_folder: dynamic_folder.into(),
            extension: extension.into(),
        }
    }

    /// Create a resolver from the server configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.document_root,
            &config.static_folder,
            &config.dynamic_folder,
            &config.extension,
        )
    }

    /// Get the document root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Classify `url_path` and compute its file path, touching no file
    pub fn resolve(&self, url_path: &str) -> Resolution {
        let Some(rest) = url_path.strip_prefix('/') else {
            return Resolution::not_found();
        };
        if rest.is_empty() {
            return Resolution::not_found();
        }

        let (tag, remainder) = rest.split_once('/').unwrap_or((rest, ""));
        let mode = if tag == self.static_folder {
            TransferMode::Static
        } else if tag == self.dynamic_folder {
            TransferMode::Dynamic
        } else {
            return Resolution::not_found();
        };

        if remainder.is_empty() || rest.split('/').any(|segment| segment == "..") {
            return Resolution::not_found();
        }

        let mut relative = rest.to_string();
        if !url_path.contains('.') {
            relative.push('.');
            relative.push_str(&self.extension);
        }

        Resolution {
            mode,
            path: Some(self.root.join(relative)),
        }
    }

    /// Resolve `url_path` and open the file it names
    ///
    /// A tag match whose file cannot be opened, or is not a regular file,
    /// ends up as `NotFound`.
    pub fn open(&self, url_path: &str) -> Resource {
        let resolution = self.resolve(url_path);
        let Some(path) = resolution.path else {
            return Resource {
                mode: TransferMode::NotFound,
                file: None,
            };
        };

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                debug!("open {} failed: {}", path.display(), e);
                return Resource {
                    mode: TransferMode::NotFound,
                    file: None,
                };
            }
        };

        match file.metadata() {
            Ok(meta) if meta.is_file() => Resource {
                mode: resolution.mode,
                file: Some(file),
            },
            _ => Resource {
                mode: TransferMode::NotFound,
                file: None,
            },
        }
    }
}
