use crate::error::CookieError;
use extor_common::types::{COOKIE_FILE_HEADER, COOKIE_FILE_LEN, COOKIE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

const COOKIE_FILE_PERMS: u32 = 0o600;
const COOKIE_FILE_PERMS_GROUP: u32 = 0o640;

/// The 32-byte shared secret proven by both ends of the handshake.
///
/// Immutable once loaded; share it behind an `Arc`.
#[derive(Clone)]
pub struct CookieSecret(Zeroizing<[u8; COOKIE_LEN]>);

impl CookieSecret {
    /// Wraps raw cookie bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; COOKIE_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Draws a fresh cookie from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; COOKIE_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    /// Raw cookie bytes, for HMAC keying only.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }
}

impl fmt::Debug for CookieSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieSecret(..)")
    }
}

/// Loads the cookie from `path`, creating it if absent.
///
/// An existing file must be exactly the 32-byte header followed by the
/// 32-byte cookie and must not be readable by other users. A new file is
/// written to a temporary sibling created with owner-only (or, with
/// `group_readable`, owner+group) permissions and then renamed into place,
/// so a reader never observes a partial cookie.
///
/// # Errors
///
/// - [`CookieError::Io`] if the file or its directory cannot be accessed.
/// - [`CookieError::Format`] if an existing file has the wrong size or header.
/// - [`CookieError::Permissions`] if an existing file is world-accessible.
pub fn load_or_create(path: &Path, group_readable: bool) -> Result<CookieSecret, CookieError> {
    if path.exists() {
        load(path)
    } else {
        create(path, group_readable)
    }
}

fn load(path: &Path) -> Result<CookieSecret, CookieError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o007 != 0 {
            return Err(CookieError::Permissions(mode & 0o777));
        }
    }

    let data = Zeroizing::new(fs::read(path)?);
    if data.len() != COOKIE_FILE_LEN {
        return Err(CookieError::Format(format!(
            "expected {COOKIE_FILE_LEN} bytes, got {}",
            data.len()
        )));
    }
    let (header, body) = data.split_at(COOKIE_FILE_HEADER.len());
    if header != COOKIE_FILE_HEADER {
        return Err(CookieError::Format("bad header".to_string()));
    }

    let mut bytes = Zeroizing::new([0u8; COOKIE_LEN]);
    bytes.copy_from_slice(body);
    info!("loaded extended orport cookie from {}", path.display());
    Ok(CookieSecret(bytes))
}

fn create(path: &Path, group_readable: bool) -> Result<CookieSecret, CookieError> {
    let secret = CookieSecret::generate();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut contents = Zeroizing::new(Vec::with_capacity(COOKIE_FILE_LEN));
    contents.extend_from_slice(COOKIE_FILE_HEADER);
    contents.extend_from_slice(secret.as_bytes());

    let tmp = temp_sibling(path)?;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if group_readable {
            COOKIE_FILE_PERMS_GROUP
        } else {
            COOKIE_FILE_PERMS
        });
    }
    #[cfg(not(unix))]
    let _ = group_readable;

    let written = options.open(&tmp).and_then(|mut file| {
        file.write_all(&contents)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    info!("created extended orport cookie at {}", path.display());
    Ok(secret)
}

/// `<name>.<pid>.tmp` next to `path`, so concurrent creators never share a
/// temporary file and no existing sibling is touched.
fn temp_sibling(path: &Path) -> Result<PathBuf, CookieError> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cookie path has no file name")
    })?;
    let mut tmp_name = OsString::from(name);
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    Ok(path.with_file_name(tmp_name))
}
