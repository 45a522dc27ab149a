use crate::common::config::AdminConfig;
use crate::common::{FaceLockError, MalformedInput, Result, StorageError};
use crate::core::TemplateEnroller;
use crate::service::listener::SocketListener;
use crate::service::protocol::{AdminRequest, AdminResponse, UploadReceipt};
use crate::service::wire::{read_frame, write_frame};
use crate::storage::{AccessEvent, EventFilter, PersistentStore, User};
use image::ImageFormat;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Parsed `<label>_<name>.<ext>` upload name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadName {
    pub label: i64,
    pub name: String,
    pub extension: String,
}

impl UploadName {
    pub fn stored_file_name(&self) -> String {
        format!("{}_{}.{}", self.label, self.name, self.extension)
    }
}

pub fn parse_upload_filename(filename: &str) -> std::result::Result<UploadName, MalformedInput> {
    let bad_format = || MalformedInput::FilenameFormat(filename.to_string());

    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(bad_format());
    }
    if filename.chars().any(char::is_control) {
        return Err(bad_format());
    }

    let (stem, extension) = filename.rsplit_once('.').ok_or_else(bad_format)?;
    let extension = extension.to_ascii_lowercase();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(MalformedInput::UnsupportedExtension(extension));
    }

    let (label, name) = stem.split_once('_').ok_or_else(bad_format)?;
    let label = match label.parse::<i64>() {
        Ok(label) if label >= 0 => label,
        _ => return Err(MalformedInput::InvalidLabel(label.to_string())),
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(bad_format());
    }

    Ok(UploadName {
        label,
        name: name.to_string(),
        extension,
    })
}

/// Enrollment and log browsing for operators. Runs on its own worker thread
/// and shares the store with the recognition loop.
pub struct AdminService {
    store: Arc<PersistentStore>,
    enroller: Arc<dyn TemplateEnroller>,
    user_images_dir: PathBuf,
    max_upload_bytes: usize,
}

impl AdminService {
    pub fn new(
        store: Arc<PersistentStore>,
        enroller: Arc<dyn TemplateEnroller>,
        user_images_dir: PathBuf,
        config: &AdminConfig,
    ) -> Result<Self> {
        fs::create_dir_all(&user_images_dir)?;
        Ok(Self {
            store,
            enroller,
            user_images_dir,
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    /// Enrolled users, each with the path of their reference image.
    pub fn manage_users(&self) -> std::result::Result<Vec<User>, StorageError> {
        self.store.list_users()
    }

    pub fn access_history(&self, filter: &EventFilter) -> std::result::Result<Vec<AccessEvent>, StorageError> {
        self.store.list_access_events(filter)
    }

    /// Stores an enrollment image and upserts the user it names.
    ///
    /// Everything about the upload is checked before anything is written: a
    /// rejected upload leaves both the image directory and the store untouched.
    pub fn upload_image(&self, filename: &str, content: &[u8]) -> Result<UploadReceipt> {
        let parsed = parse_upload_filename(filename)?;
        self.check_content(content)?;

        let destination = self.user_images_dir.join(parsed.stored_file_name());
        let previous = self.store.get_user(parsed.label)?.map(|user| user.image_path);
        let existed = previous.is_some();
        let replaces_other_file = previous.as_ref().is_some_and(|old| *old != destination);
        write_atomically(&destination, content)?;

        let user = match self
            .store
            .enroll_or_update_user(parsed.label, &parsed.name, &destination)
        {
            Ok(user) => user,
            Err(e) => {
                if !existed || replaces_other_file {
                    let _ = fs::remove_file(&destination);
                }
                return Err(e.into());
            }
        };

        if let Some(old) = previous.filter(|_| replaces_other_file) {
            if let Err(e) = fs::remove_file(&old) {
                tracing::warn!("Could not remove superseded image {}: {}", old.display(), e);
            }
        }

        let template_refreshed = match self.enroller.refresh(&user) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Enrolled user {} but template refresh failed: {}", user.label, e);
                false
            }
        };

        tracing::info!(
            "{} user {} ({}) from {}",
            if existed { "Re-enrolled" } else { "Enrolled" },
            user.label,
            user.name,
            filename
        );
        Ok(UploadReceipt {
            user,
            created: !existed,
            template_refreshed,
        })
    }

    pub fn handle(&self, request: AdminRequest) -> AdminResponse {
        let result = match request {
            AdminRequest::ListUsers => self
                .manage_users()
                .map(AdminResponse::Users)
                .map_err(FaceLockError::from),
            AdminRequest::UploadImage { filename, content } => self
                .upload_image(&filename, &content)
                .map(AdminResponse::Uploaded),
            AdminRequest::ListEvents(filter) => self
                .access_history(&filter)
                .map(AdminResponse::Events)
                .map_err(FaceLockError::from),
        };

        result.unwrap_or_else(|e| {
            tracing::info!("Admin request refused: {}", e);
            AdminResponse::Error(e.to_string())
        })
    }

    /// Answers requests on `listener` until `shutdown` is raised. A connection
    /// may carry any number of requests.
    pub fn serve(&self, listener: &SocketListener, shutdown: &AtomicBool) -> Result<()> {
        listener.serve(shutdown, |mut stream| {
            while let Some(request) = read_frame::<_, AdminRequest>(&mut stream)? {
                let response = self.handle(request);
                write_frame(&mut stream, &response)?;
            }
            Ok(())
        })
    }

    fn check_content(&self, content: &[u8]) -> std::result::Result<(), MalformedInput> {
        if content.is_empty() {
            return Err(MalformedInput::EmptyUpload);
        }
        if content.len() > self.max_upload_bytes {
            return Err(MalformedInput::TooLarge {
                size: content.len(),
                limit: self.max_upload_bytes,
            });
        }
        match image::guess_format(content) {
            Ok(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp) => {}
            _ => return Err(MalformedInput::NotAnImage),
        }
        image::load_from_memory(content).map_err(|_| MalformedInput::NotAnImage)?;
        Ok(())
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}
