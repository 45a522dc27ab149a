use crate::common::Result;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Unix socket that polls for connections so a shutdown flag can stop it.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Binds `path`, replacing a stale socket file left by an earlier run.
    pub fn bind(path: &Path, mode: u32) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        listener.set_nonblocking(true)?;

        tracing::info!("Listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands each accepted connection to `handle`, one at a time, until
    /// `shutdown` is raised.
    pub fn serve<F>(&self, shutdown: &AtomicBool, mut handle: F) -> Result<()>
    where
        F: FnMut(UnixStream) -> Result<()>,
    {
        while !shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Some(peer) = peer_credentials(&stream) {
                        tracing::debug!(
                            "Connection on {} from uid {} pid {}",
                            self.path.display(), peer.uid, peer.pid
                        );
                    }
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
                    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;

                    if let Err(e) = handle(stream) {
                        tracing::warn!("Client error on {}: {}", self.path.display(), e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Peer process identity from `SO_PEERCRED`.
pub fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::mem;
    use std::os::unix::io::AsRawFd;

    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut cred_len = mem::size_of::<libc::ucred>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut cred_len,
        )
    };
    if ret != 0 {
        return None;
    }

    Some(PeerCredentials {
        pid: cred.pid as u32,
        uid: cred.uid,
        gid: cred.gid,
    })
}
