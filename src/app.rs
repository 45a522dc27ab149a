use crate::camera::V4l2Camera;
use crate::common::{system_models_dir, Comparison, Config, FaceLockError, Result, StartupFailure};
use crate::core::{
    AccessControlEngine, AdmissionPolicy, DenialTracker, EmbeddingRecognizer, FaceDetector,
    FaceEmbedder, FaceRecognizer, GalleryEnroller, Notifier, OnnxEmbedder, OnnxFaceDetector,
    RecognitionPipeline, TemplateEnroller, TemplateGallery, TracingNotifier,
};
use crate::hardware::{LockActuator, SysfsPin, TimedLock};
use crate::service::{
    AdminService, CommandSource, RemoteCommandChannel, SocketCommandSource, SocketListener,
    Supervisor,
};
use crate::storage::{AccessLogger, ImageArchive, PersistentStore, StoreOptions};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const ADMIN_SOCKET_MODE: u32 = 0o660;
const REMOTE_SOCKET_MODE: u32 = 0o660;

/// Capability implementations the context is built from. Hardware builds use
/// [`AppContext::from_config`]; tests hand in doubles through [`AppContext::assemble`].
pub struct Components {
    pub actuator: Arc<dyn LockActuator>,
    pub detector: Arc<dyn FaceDetector>,
    pub recognizer: Arc<dyn FaceRecognizer>,
    pub enroller: Arc<dyn TemplateEnroller>,
    pub notifier: Arc<dyn Notifier>,
}

/// Every long-lived handle in the process, created once and passed explicitly.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<PersistentStore>,
    pub logger: Arc<AccessLogger>,
    pub engine: Arc<AccessControlEngine>,
    pub admin: Arc<AdminService>,
    pub remote: Arc<RemoteCommandChannel>,
    detector: Arc<dyn FaceDetector>,
    recognizer: Arc<dyn FaceRecognizer>,
    timed_lock: Option<Arc<TimedLock>>,
}

impl AppContext {
    /// Opens the store and wires the logger, engine and services around the
    /// given capabilities. Events left in the degraded journal are replayed.
    pub fn assemble(config: Config, store: PersistentStore, components: Components) -> Result<Self> {
        let store = Arc::new(store);
        let archive = ImageArchive::new(config.storage.access_images_dir.clone())
            .map_err(|e| StartupFailure::Store(format!("access image directory: {}", e)))?;
        let logger = Arc::new(
            AccessLogger::new(Arc::clone(&store), archive, config.storage.access_log_file.clone())
                .map_err(|e| StartupFailure::Store(format!("access log: {}", e)))?,
        );

        match logger.replay_degraded() {
            Ok(0) => {}
            Ok(n) => tracing::info!("Recovered {} journaled access events", n),
            Err(e) => tracing::warn!("Degraded journal replay failed: {}", e),
        }

        let engine = Arc::new(AccessControlEngine::new(
            components.actuator,
            Arc::clone(&logger),
            AdmissionPolicy::from_config(&config.recognition),
            DenialTracker::from_config(&config.alerts),
            components.notifier,
        ));

        let admin = Arc::new(AdminService::new(
            Arc::clone(&store),
            components.enroller,
            config.storage.user_images_dir.clone(),
            &config.admin,
        )?);
        let remote = Arc::new(RemoteCommandChannel::new(Arc::clone(&engine), &config.remote));

        Ok(Self {
            config,
            store,
            logger,
            engine,
            admin,
            remote,
            detector: components.detector,
            recognizer: components.recognizer,
            timed_lock: None,
        })
    }

    /// Builds the production context: store, GPIO, models, then camera. Any
    /// of them failing is a [`StartupFailure`].
    pub fn from_config(config: Config) -> Result<(Self, V4l2Camera)> {
        if config.recognition.comparison != Comparison::HigherIsBetter {
            return Err(StartupFailure::Config(
                "the embedding recognizer reports cosine similarity; set recognition.comparison = \"higher_is_better\"".into(),
            )
            .into());
        }

        let options = StoreOptions {
            busy_timeout: Duration::from_millis(config.storage.busy_timeout_ms),
            reader_connections: config.storage.reader_connections,
        };
        let store = PersistentStore::open(&config.storage.database_path, &options).map_err(|e| {
            StartupFailure::Store(format!("{}: {}", config.storage.database_path.display(), e))
        })?;

        let pin = SysfsPin::open(&config.lock.gpio_root, config.lock.gpio_pin)?;
        let timed_lock = Arc::new(TimedLock::new(
            Box::new(pin),
            Duration::from_millis(config.lock.unlock_duration_ms),
        ));

        let detector: Arc<dyn FaceDetector> = Arc::new(load_detector(&config)?);
        let embedder: Arc<dyn FaceEmbedder> = Arc::new(OnnxEmbedder::new(&config)?);
        let gallery = Arc::new(RwLock::new(TemplateGallery::new()));
        let recognizer = Arc::new(EmbeddingRecognizer::new(Arc::clone(&embedder), Arc::clone(&gallery)));
        let enroller = Arc::new(GalleryEnroller::new(Arc::clone(&detector), embedder, gallery));

        let users = store
            .list_users()
            .map_err(|e| StartupFailure::Store(format!("cannot list users: {}", e)))?;
        enroller.load_all(&users);

        let camera = V4l2Camera::open(&config)?;

        let components = Components {
            actuator: timed_lock.clone(),
            detector,
            recognizer,
            enroller,
            notifier: Arc::new(TracingNotifier),
        };
        let mut context = Self::assemble(config, store, components)?;
        context.timed_lock = Some(timed_lock);
        Ok((context, camera))
    }

    pub fn pipeline(&self) -> RecognitionPipeline {
        RecognitionPipeline::new(
            Arc::clone(&self.detector),
            Arc::clone(&self.recognizer),
            self.config.recognition.frame_skip,
        )
    }

    /// Starts the admin worker on its socket and the remote worker on `source`.
    pub fn start_workers(&self, supervisor: &mut Supervisor, mut source: Box<dyn CommandSource>) -> Result<()> {
        let listener = SocketListener::bind(&self.config.admin.socket_path, ADMIN_SOCKET_MODE)?;
        let admin = Arc::clone(&self.admin);
        supervisor.spawn("admin", move |shutdown| admin.serve(&listener, &shutdown))?;

        let remote = Arc::clone(&self.remote);
        supervisor.spawn("remote", move |shutdown| source.serve(&remote, &shutdown))?;
        Ok(())
    }

    /// The default remote transport: the configured Unix socket.
    pub fn socket_command_source(&self) -> Result<Box<dyn CommandSource>> {
        let listener = SocketListener::bind(&self.config.remote.socket_path, REMOTE_SOCKET_MODE)?;
        Ok(Box::new(SocketCommandSource::new(listener)))
    }

    /// Stops workers, forces the lock shut, then closes the store once every
    /// other handle on it is gone.
    pub fn shutdown(self, supervisor: &mut Supervisor) -> Result<()> {
        supervisor.shutdown();

        if let Err(e) = self.engine.actuator().lock() {
            tracing::error!("Failed to engage lock during shutdown: {}", e);
        }
        if let Some(timed_lock) = &self.timed_lock {
            if let Err(e) = timed_lock.shutdown() {
                tracing::error!("Relock timer shutdown failed: {}", e);
            }
        }

        let Self {
            store,
            logger,
            engine,
            admin,
            remote,
            ..
        } = self;
        drop(remote);
        drop(admin);
        drop(engine);
        drop(logger);

        match Arc::try_unwrap(store) {
            Ok(store) => store.close().map_err(FaceLockError::from),
            Err(_) => {
                tracing::warn!("Store still referenced at shutdown; leaving it to drop");
                Ok(())
            }
        }
    }
}

fn load_detector(config: &Config) -> std::result::Result<OnnxFaceDetector, StartupFailure> {
    let path = &config.models.detector_path;
    if path.is_relative() && !path.exists() {
        let models = system_models_dir();
        tracing::debug!("Detector not found at {}, trying {}", path.display(), models.display());
        return OnnxFaceDetector::new_with_model_path(config, &models);
    }
    OnnxFaceDetector::new(config)
}
