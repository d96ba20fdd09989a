use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// 用戶端 TLS 身分 (PKCS#12)
#[derive(Clone)]
pub struct ClientIdentity {
    pub der: Vec<u8>,
    pub password: String,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("der_len", &self.der.len())
            .field("password", &"***")
            .finish()
    }
}

/// 依主體名稱查找用戶端憑證
#[cfg_attr(test, mockall::automock)]
pub trait CertificateResolver: Send + Sync {
    fn try_find_certificate(&self, subject_name: &str) -> Option<ClientIdentity>;
}

/// 從目錄讀取 `<subject>.p12` 的憑證查找器
#[derive(Clone, Debug)]
pub struct FileCertificateResolver {
    directory: PathBuf,
    password: String,
}

impl FileCertificateResolver {
    pub fn new(directory: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            password: password.into(),
        }
    }
}

impl CertificateResolver for FileCertificateResolver {
    fn try_find_certificate(&self, subject_name: &str) -> Option<ClientIdentity> {
        let path = self.directory.join(format!("{}.p12", subject_name));
        match fs::read(&path) {
            Ok(der) if !der.is_empty() => {
                debug!("Loaded client certificate from {}", path.display());
                Some(ClientIdentity {
                    der,
                    password: self.password.clone(),
                })
            }
            Ok(_) => {
                warn!("Client certificate file {} is empty", path.display());
                None
            }
            Err(e) => {
                warn!("Unable to read client certificate {}: {}", path.display(), e);
                None
            }
        }
    }
}
